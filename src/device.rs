use crate::error::Error;
use std::{fmt, str::FromStr};

pub(crate) const DEFAULT_DEVICE: &str = "cpu";

/// Where tensor math runs. Parsed from `--device` at startup, which rejects
/// anything but the cpu; the numeric code never branches on placement.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Device {
    Cpu,
}

impl Default for Device {
    fn default() -> Self {
        Self::Cpu
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => f.write_str("cpu"),
        }
    }
}

impl FromStr for Device {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim().to_lowercase();
        match name.as_str() {
            "cpu" => Ok(Self::Cpu),
            // accelerators are recognised so the message can say why they fail
            _ if ["cuda", "mps", "rocm"]
                .iter()
                .any(|prefix| name.starts_with(prefix)) =>
            {
                Err(Error::UnsupportedDevice(name))
            }
            _ => Err(Error::UnknownDevice(name)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_cpu() {
        assert_eq!(" CPU ".parse::<Device>().unwrap(), Device::Cpu);
        assert_eq!(Device::default().to_string(), DEFAULT_DEVICE);
    }

    #[test]
    fn accelerators_are_unsupported() {
        assert!(matches!(
            "cuda:0".parse::<Device>(),
            Err(Error::UnsupportedDevice(_))
        ));
        assert!(matches!(
            "tpu".parse::<Device>(),
            Err(Error::UnknownDevice(_))
        ));
    }
}
