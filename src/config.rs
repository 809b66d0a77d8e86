use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;

/// Default location of the persisted user inputs, next to the binary's
/// working directory.
pub const USER_CONFIG_FILE: &str = "loss_recovery_config.json";

/// Persisted sidebar inputs. Every field has a default so a partial file
/// fills in the rest.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserConfig {
    pub initial_capital: f64,
    pub market_loss_input_pct: f64,
    pub loss_margin_pct_at_loss: u32,
    pub max_recovery_trades: usize,
    pub actual_loss_amount: f64,
}

impl Default for UserConfig {
    fn default() -> Self {
        Self {
            initial_capital: 1_000_000.0,
            market_loss_input_pct: 7.67,
            loss_margin_pct_at_loss: 40,
            max_recovery_trades: 5,
            actual_loss_amount: 0.0,
        }
    }
}

impl UserConfig {
    /// Loads the config file. A missing file means defaults; malformed JSON
    /// is treated as an empty file rather than a fatal error.
    pub fn load(path: &Path) -> Self {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Self::default(),
            Err(err) => {
                tracing::warn!("failed to read {}: {err}; using defaults", path.display());
                return Self::default();
            }
        };
        match serde_json::from_str(&contents) {
            Ok(config) => config,
            Err(err) => {
                tracing::warn!(
                    "malformed config at {}: {err}; using defaults",
                    path.display()
                );
                Self::default()
            }
        }
    }

    /// Writes the full config, staging to a sibling temp file and renaming it
    /// into place so readers never observe a partial write.
    pub fn save(&self, path: &Path) -> io::Result<()> {
        let json = serde_json::to_string_pretty(self).map_err(io::Error::other)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, path)?;
        tracing::info!("saved user config to {}", path.display());
        Ok(())
    }
}
