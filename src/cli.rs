//! Command-line surface.

use std::path::PathBuf;

use clap::Parser;

use crate::supervisor::Mode;

/// CAN telemetry edge agent.
#[derive(Debug, Parser)]
#[command(name = "can-telemetry-agent", version, about)]
pub struct Cli {
    /// Path to the YAML configuration file.
    #[arg(long)]
    pub config: PathBuf,

    /// Run against a synthetic CAN traffic generator instead of real hardware.
    #[arg(long, conflicts_with_all = ["dry_run", "decode_live"])]
    pub simulate: bool,

    /// Run the full local pipeline (batching) with uploading forced off.
    #[arg(long = "dry-run", conflicts_with_all = ["simulate", "decode_live"])]
    pub dry_run: bool,

    /// Decode live frames against the message-definition database and print them; no storage.
    #[arg(long = "decode-live", conflicts_with_all = ["simulate", "dry_run"])]
    pub decode_live: bool,
}

impl Cli {
    /// The run mode selected by the mutually-exclusive flags.
    pub fn mode(&self) -> Mode {
        if self.simulate {
            Mode::Simulation
        } else if self.dry_run {
            Mode::DryRun
        } else if self.decode_live {
            Mode::DecodeLive
        } else {
            Mode::Normal
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_normal_mode() {
        let cli = Cli::parse_from(["agent", "--config", "config.yaml"]);
        assert_eq!(cli.mode(), Mode::Normal);
    }

    #[test]
    fn simulate_flag_selects_simulation_mode() {
        let cli = Cli::parse_from(["agent", "--config", "config.yaml", "--simulate"]);
        assert_eq!(cli.mode(), Mode::Simulation);
    }

    #[test]
    fn dry_run_flag_selects_dry_run_mode() {
        let cli = Cli::parse_from(["agent", "--config", "config.yaml", "--dry-run"]);
        assert_eq!(cli.mode(), Mode::DryRun);
    }

    #[test]
    fn decode_live_flag_selects_decode_live_mode() {
        let cli = Cli::parse_from(["agent", "--config", "config.yaml", "--decode-live"]);
        assert_eq!(cli.mode(), Mode::DecodeLive);
    }

    #[test]
    fn simulate_and_dry_run_together_is_rejected() {
        let result = Cli::try_parse_from(["agent", "--config", "config.yaml", "--simulate", "--dry-run"]);
        assert!(result.is_err());
    }
}
