//! Configuration parameters struct parsing helper.

/// Composes a configuration struct from its default values, then overlays
/// the fields given in an optional TOML string. Returns `Ok(config)` on
/// success and `Err(ShardsetError)` on parse failure or unknown field.
///
/// Example:
/// ```ignore
/// let config = parsed_config!(config_str => ServerConfig;
///                             snapshot_threshold, client_wait_ms)?;
/// ```
#[macro_export]
macro_rules! parsed_config {
    ($config_str:expr => $config_type:ty; $($field:ident),+) => {{
        let config_str: Option<&str> = $config_str;

        // closure helper for easier error returning
        let overlay = || -> Result<$config_type, ShardsetError> {
            let mut config: $config_type = Default::default();
            let Some(s) = config_str else {
                return Ok(config);
            };

            let mut table = s.parse::<toml::Table>()?;
            $(
                if let Some(value) = table.remove(stringify!($field)) {
                    config.$field = value.try_into()?;
                }
            )+

            // any leftover key was not a recognized field name
            if let Some(stray) = table.keys().next() {
                return Err(ShardsetError(format!(
                    "invalid field name '{}' in config",
                    stray,
                )));
            }

            Ok(config)
        };

        overlay()
    }};
}
