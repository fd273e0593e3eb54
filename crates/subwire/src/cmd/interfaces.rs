use subwire_transport::ipv4_interfaces;

use crate::cmd::InterfacesArgs;
use crate::exit::{transport_error, CliResult, SUCCESS};
use crate::output::{print_interfaces, OutputFormat};

pub fn run(args: InterfacesArgs, format: OutputFormat) -> CliResult<i32> {
    let mut interfaces =
        ipv4_interfaces().map_err(|err| transport_error("listing interfaces failed", err))?;
    if args.multicast {
        interfaces.retain(|iface| iface.up && iface.multicast);
    }
    print_interfaces(&interfaces, format);
    Ok(SUCCESS)
}
