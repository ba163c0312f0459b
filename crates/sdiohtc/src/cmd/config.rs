use sdiohtc_device::DeviceConfig;

use crate::cmd::ConfigArgs;
use crate::exit::{CliError, CliResult, INTERNAL, SUCCESS};

pub fn run(args: ConfigArgs, config: DeviceConfig) -> CliResult<i32> {
    println!("{}", render(&config, args.compact)?);
    Ok(SUCCESS)
}

fn render(config: &DeviceConfig, compact: bool) -> CliResult<String> {
    let text = if compact {
        serde_json::to_string(config)
    } else {
        serde_json::to_string_pretty(config)
    };
    text.map_err(|err| CliError::new(INTERNAL, format!("config serialization failed: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rendered_config_loads_back() {
        let config = DeviceConfig::default().with_block_size(128).with_bundling(false);
        let text = render(&config, true).expect("render");
        assert!(!text.contains('\n'));
        let parsed: DeviceConfig = serde_json::from_str(&text).expect("parse");
        assert_eq!(parsed, config);
    }

    #[test]
    fn partial_config_fills_defaults() {
        let parsed: DeviceConfig =
            serde_json::from_str(r#"{"block_size": 512, "irq": {"recheck_count": 2}}"#)
                .expect("parse");
        assert_eq!(parsed.block_size, 512);
        assert_eq!(parsed.irq.recheck_count, 2);
        assert_eq!(parsed.bundle, DeviceConfig::default().bundle);
    }
}
