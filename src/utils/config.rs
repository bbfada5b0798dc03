//! TOML overlay parsing for the replica and client config structs.

/// Starts from the config type's `Default`, then overwrites each listed field
/// found in the TOML string, if one is given. Keys that are not listed are an
/// error, as is a value of the wrong type.
///
/// Example:
/// ```no_compile
/// let config = parsed_config!(config_str => MyConfig; hb_period_ms, backer_dir)?;
/// ```
#[macro_export]
macro_rules! parsed_config {
    ($config_str:expr => $config_type:ty; $($field:ident),+) => {{
        let config_str: Option<&str> = $config_str;

        // closure helper for easier error returning
        let compose_config = || -> Result<$config_type, $crate::PaxosLogError> {
            let mut config: $config_type = Default::default();
            let Some(config_str) = config_str else {
                return Ok(config);
            };

            let mut table = config_str.parse::<toml::Table>()?;

            // traverse through all given field names
            $({
                // if field name found in table (and removed)
                if let Some(v) = table.remove(stringify!($field)) {
                    config.$field = v.try_into()?;
                }
            })+

            // if table is not empty at this time, some parsed keys are not
            // expected hence invalid
            if let Some(key) = table.keys().next() {
                return Err($crate::PaxosLogError::msg(format!(
                    "invalid field name '{}' in config",
                    key,
                )));
            }

            Ok(config)
        };

        compose_config()
    }};
}

#[cfg(test)]
mod config_tests {
    use crate::utils::PaxosLogError;

    #[derive(Debug, PartialEq)]
    struct PeerConfig {
        period_ms: u64,
        loss_rate: f64,
        backer_dir: String,
        hole: i64,
    }

    impl Default for PeerConfig {
        fn default() -> Self {
            PeerConfig {
                period_ms: 2000,
                loss_rate: 0.0,
                backer_dir: "/tmp".into(),
                hole: -1,
            }
        }
    }

    #[test]
    fn none_gives_defaults() -> Result<(), PaxosLogError> {
        let config = parsed_config!(None => PeerConfig; period_ms, hole)?;
        assert_eq!(config, PeerConfig::default());
        Ok(())
    }

    #[test]
    fn overrides_listed_fields() -> Result<(), PaxosLogError> {
        let config_str = Some("loss_rate = 0.3\nhole = 4");
        let config = parsed_config!(config_str => PeerConfig;
                                    period_ms, loss_rate, hole)?;
        assert_eq!(
            config,
            PeerConfig {
                loss_rate: 0.3,
                hole: 4,
                ..Default::default()
            }
        );
        Ok(())
    }

    #[test]
    fn unlisted_field_rejected() {
        // valid field of the struct, but not among those parsed
        let config_str = Some("backer_dir = '/var/tmp'");
        assert!(parsed_config!(config_str => PeerConfig; period_ms).is_err());
        assert!(parsed_config!(Some("hole = 'x'") => PeerConfig; hole).is_err());
        assert!(parsed_config!(Some("period_ms = ") => PeerConfig; period_ms)
            .is_err());
    }
}
