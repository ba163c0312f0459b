use crate::cmd::VersionArgs;
use crate::exit::{CliResult, SUCCESS};

pub fn run(args: VersionArgs) -> CliResult<i32> {
    if !args.extended {
        println!("sdiohtc {}", env!("CARGO_PKG_VERSION"));
        return Ok(SUCCESS);
    }

    println!("name: sdiohtc");
    println!("version: {}", env!("CARGO_PKG_VERSION"));
    println!(
        "target: {}",
        option_env!("SDIOHTC_BUILD_TARGET").unwrap_or("unknown")
    );
    println!("block_size_default: {}", sdiohtc_device::DEFAULT_BLOCK_SIZE);
    println!(
        "max_bundle_messages: {}",
        sdiohtc_frame::MAX_BUNDLE_MESSAGES
    );
    println!(
        "features: sim={}, async={}, cli=true",
        cfg!(feature = "sim"),
        cfg!(feature = "async")
    );

    Ok(SUCCESS)
}
