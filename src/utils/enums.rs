use std::{fmt::Display, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{utils::vectors::Vec4, KinFitError};

/// A single component of a four-momentum.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Component {
    /// The x-component of the momentum.
    Px,
    /// The y-component of the momentum.
    Py,
    /// The z-component of the momentum.
    Pz,
    /// The energy.
    E,
}

impl Component {
    /// The index of this component in $`(p_x, p_y, p_z, E)`$ ordering.
    pub fn index(&self) -> usize {
        match self {
            Component::Px => 0,
            Component::Py => 1,
            Component::Pz => 2,
            Component::E => 3,
        }
    }
    /// Extract this component from a four-momentum.
    pub fn of(&self, p4: &Vec4) -> f64 {
        match self {
            Component::Px => p4.px(),
            Component::Py => p4.py(),
            Component::Pz => p4.pz(),
            Component::E => p4.e(),
        }
    }
}

impl Display for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Component::Px => write!(f, "px"),
            Component::Py => write!(f, "py"),
            Component::Pz => write!(f, "pz"),
            Component::E => write!(f, "E"),
        }
    }
}

impl FromStr for Component {
    type Err = KinFitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "px" | "x" => Ok(Self::Px),
            "py" | "y" => Ok(Self::Py),
            "pz" | "z" => Ok(Self::Pz),
            "e" | "energy" => Ok(Self::E),
            _ => Err(KinFitError::config(format!(
                "\"{}\" does not correspond to a valid four-momentum component",
                s
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enum_displays() {
        assert_eq!(format!("{}", Component::Px), "px");
        assert_eq!(format!("{}", Component::E), "E");
    }

    #[test]
    fn enum_from_str() {
        assert_eq!("PZ".parse::<Component>().unwrap(), Component::Pz);
        assert_eq!("energy".parse::<Component>().unwrap(), Component::E);
        assert!("pt".parse::<Component>().is_err());
    }

    #[test]
    fn component_extraction() {
        let p4 = Vec4::new(1.0, 2.0, 3.0, 4.0);
        for (component, expected) in [
            (Component::Px, 1.0),
            (Component::Py, 2.0),
            (Component::Pz, 3.0),
            (Component::E, 4.0),
        ] {
            assert_eq!(component.of(&p4), expected);
            assert_eq!(component.index() as f64 + 1.0, expected);
        }
    }
}
