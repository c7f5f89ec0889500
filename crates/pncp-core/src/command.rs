use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The closed set of commands an agent will execute. Membership changes by
/// redeploying the controller, never at runtime.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum CommandKey {
    Uptime,
    Hostname,
    Disk,
    Metrics,
    Lslogs,
    Network,
}

impl CommandKey {
    pub const ALL: [CommandKey; 6] = [
        CommandKey::Uptime,
        CommandKey::Hostname,
        CommandKey::Disk,
        CommandKey::Metrics,
        CommandKey::Lslogs,
        CommandKey::Network,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKey::Uptime => "uptime",
            CommandKey::Hostname => "hostname",
            CommandKey::Disk => "disk",
            CommandKey::Metrics => "metrics",
            CommandKey::Lslogs => "lslogs",
            CommandKey::Network => "network",
        }
    }
}

impl fmt::Display for CommandKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandKey {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "uptime" => Ok(CommandKey::Uptime),
            "hostname" => Ok(CommandKey::Hostname),
            "disk" => Ok(CommandKey::Disk),
            "metrics" => Ok(CommandKey::Metrics),
            "lslogs" => Ok(CommandKey::Lslogs),
            "network" => Ok(CommandKey::Network),
            other => Err(format!("not a whitelisted command: {other}")),
        }
    }
}

/// Terminal state of an accepted command request. Rejected commands never
/// become requests and are reported separately at the parse boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    Success { output: String },
    Failure { exit_code: i32, output: String },
    Timeout,
}

impl CommandOutcome {
    pub fn status(&self) -> &'static str {
        match self {
            CommandOutcome::Success { .. } => "success",
            CommandOutcome::Failure { .. } => "failure",
            CommandOutcome::Timeout => "timeout",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_key_round_trips_through_its_name() {
        for key in CommandKey::ALL {
            assert_eq!(key.as_str().parse::<CommandKey>(), Ok(key));
        }
    }

    #[test]
    fn parse_normalizes_case_and_whitespace() {
        assert_eq!(" Uptime ".parse::<CommandKey>(), Ok(CommandKey::Uptime));
    }

    #[test]
    fn arbitrary_strings_are_rejected() {
        assert!("reboot".parse::<CommandKey>().is_err());
        assert!("uptime; rm -rf /".parse::<CommandKey>().is_err());
        assert!("".parse::<CommandKey>().is_err());
    }
}
