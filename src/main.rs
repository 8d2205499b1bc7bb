//! Tinderbox - network boot server.
//!
//! Boots every PXE client on the network into the kernel, EFI binary or
//! iPXE script named on the command line.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use anyhow::{bail, Context as _, Result};
use clap::Parser;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use tinderbox::{BootSpec, FileId, Firmware, Server, StaticBooter};

/// Network boot server
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Kernel to boot (URL or local path)
    #[arg(long, conflicts_with_all = ["efi", "ipxe_script"])]
    kernel: Option<String>,

    /// Init ramdisk for the kernel; repeatable
    #[arg(long)]
    initrd: Vec<String>,

    /// Kernel command line template ({{ID "x"}} expands to a served URL)
    #[arg(long, default_value = "")]
    cmdline: String,

    /// Message to print on the client before booting
    #[arg(long)]
    message: Option<String>,

    /// EFI binary to chainload instead of a kernel (URL or local path)
    #[arg(long, conflicts_with = "ipxe_script")]
    efi: Option<String>,

    /// File containing a raw iPXE script to hand to every client
    #[arg(long)]
    ipxe_script: Option<PathBuf>,

    /// Directory holding the stage-two iPXE binaries
    /// (undionly.kpxe, i386.ipxe.efi, amd64.ipxe.efi)
    #[arg(long)]
    ipxe_dir: PathBuf,

    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0")]
    address: Ipv4Addr,

    /// Network interface to use (default: auto-detect)
    #[arg(short, long)]
    interface: Option<String>,

    /// Snoop DHCP instead of binding port 67, to coexist with the
    /// network's own DHCP server
    #[arg(long)]
    dhcp_no_bind: bool,

    /// HTTP port for boot services
    #[arg(long, default_value_t = 80)]
    http_port: u16,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("tinderbox=info".parse().unwrap()),
        )
        .init();

    if let Err(e) = run(Args::parse()) {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    let spec = boot_spec(&args)?;
    let booter = StaticBooter::new(spec).context("invalid boot configuration")?;

    let mut server = Server::new(Arc::new(booter));
    server.address = args.address;
    server.http_port = args.http_port;
    server.interface = args.interface;
    server.dhcp_no_bind = args.dhcp_no_bind;
    server.ipxe = load_firmwares(&args.ipxe_dir)?;

    let server = Arc::new(server);
    let handle = server.clone();
    ctrlc::set_handler(move || {
        eprintln!("\nShutting down...");
        handle.shutdown();
    })
    .context("setting interrupt handler")?;

    server.serve().context("boot server failed")?;
    Ok(())
}

fn boot_spec(args: &Args) -> Result<BootSpec> {
    if let Some(path) = &args.ipxe_script {
        let script = std::fs::read_to_string(path)
            .with_context(|| format!("reading iPXE script {}", path.display()))?;
        return Ok(BootSpec {
            ipxe_script: Some(script),
            ..Default::default()
        });
    }
    if let Some(efi) = &args.efi {
        return Ok(BootSpec {
            efi: Some(FileId::from(efi.as_str())),
            ..Default::default()
        });
    }
    if let Some(kernel) = &args.kernel {
        return Ok(BootSpec {
            kernel: Some(FileId::from(kernel.as_str())),
            initrd: args.initrd.iter().map(|i| FileId::from(i.as_str())).collect(),
            cmdline: args.cmdline.clone(),
            message: args.message.clone(),
            ..Default::default()
        });
    }
    bail!("one of --kernel, --efi or --ipxe-script is required");
}

/// Load the stage-two iPXE binaries shipped alongside the server. Missing
/// files just disable their firmware family.
fn load_firmwares(dir: &Path) -> Result<HashMap<Firmware, Vec<u8>>> {
    let files = [
        (Firmware::X86Pc, "undionly.kpxe"),
        (Firmware::EfiIa32, "i386.ipxe.efi"),
        (Firmware::EfiBc, "amd64.ipxe.efi"),
        (Firmware::EfiX64, "amd64.ipxe.efi"),
    ];

    let mut ipxe = HashMap::new();
    for (firmware, name) in files {
        match std::fs::read(dir.join(name)) {
            Ok(bytes) => {
                ipxe.insert(firmware, bytes);
            }
            Err(e) => {
                warn!("no iPXE binary for {firmware} ({name}): {e}");
            }
        }
    }
    if ipxe.is_empty() {
        bail!("no iPXE binaries found in {}", dir.display());
    }
    Ok(ipxe)
}
