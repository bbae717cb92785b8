use crate::cmd::VersionArgs;
use crate::exit::{CliResult, SUCCESS};

pub fn run(args: VersionArgs) -> CliResult<i32> {
    println!("msgport {}", env!("CARGO_PKG_VERSION"));
    if !args.extended {
        return Ok(SUCCESS);
    }

    println!(
        "target: {}",
        option_env!("MSGPORT_BUILD_TARGET").unwrap_or("unknown")
    );
    println!(
        "profile: {}",
        option_env!("MSGPORT_BUILD_PROFILE").unwrap_or("unknown")
    );
    println!("os: {}", std::env::consts::OS);
    println!("arch: {}", std::env::consts::ARCH);
    println!(
        "codec: max_payload_size={} max_depth={}",
        msgport_channel::codec::DEFAULT_MAX_PAYLOAD,
        msgport_channel::codec::DEFAULT_MAX_DEPTH
    );

    Ok(SUCCESS)
}
