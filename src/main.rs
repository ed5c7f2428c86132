//! kcall - Privileged Call Bridge self-check
//!
//! Menjalankan request lengkap lewat control device terhadap host kernel:
//! allocate → write → read back → call routine → free.
//!
//! Usage:
//!   cargo run --release -- [OPTIONS]

#[cfg(all(target_os = "linux", target_pointer_width = "64"))]
use kcall::{
    config::REQUEST_IOCTL_CODE, ffi::ScalarType, kernel::HostKernel, protocol::RequestEncoder,
    Completion, ControlDevice, Status,
};

/// Self-check configuration
struct CheckConfig {
    module: String,
    routine: String,
    size: u32,
    verbose: bool,
}

impl Default for CheckConfig {
    fn default() -> Self {
        Self {
            module: "libc".to_string(),
            routine: "getpid".to_string(),
            size: 0x1000,
            verbose: false,
        }
    }
}

fn parse_args() -> CheckConfig {
    let args: Vec<String> = std::env::args().collect();
    let mut config = CheckConfig::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--module" | "-m" => {
                if i + 1 < args.len() {
                    config.module = args[i + 1].clone();
                    i += 1;
                }
            }
            "--routine" | "-r" => {
                if i + 1 < args.len() {
                    config.routine = args[i + 1].clone();
                    i += 1;
                }
            }
            "--size" => {
                if i + 1 < args.len() {
                    config.size = parse_size(&args[i + 1]).unwrap_or(0x1000);
                    i += 1;
                }
            }
            "--verbose" | "-v" => {
                config.verbose = true;
            }
            "--help" | "-h" => {
                println!("kcall - Privileged Call Bridge self-check\n");
                println!("Usage: kcall [OPTIONS]\n");
                println!("Options:");
                println!("  -m, --module <NAME>   Module exporting the routine (default: libc)");
                println!("  -r, --routine <NAME>  Routine to call, no arguments, int return (default: getpid)");
                println!("      --size <BYTES>    Allocation size, decimal or 0x-hex (default: 0x1000)");
                println!("  -v, --verbose         Debug logging");
                println!("  -h, --help            Show this help");
                std::process::exit(0);
            }
            _ => {}
        }
        i += 1;
    }

    config
}

fn parse_size(value: &str) -> Option<u32> {
    match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => value.parse().ok(),
    }
}

#[cfg(all(target_os = "linux", target_pointer_width = "64"))]
fn submit(device: &ControlDevice<HostKernel>, request: &[u8]) -> Result<(), String> {
    let mut output = [0u8; 256];
    // SAFETY: every address in the requests below points at live locals or at
    // the block returned by ALLOCATE, with matching lengths.
    let Completion {
        status,
        information,
    } = unsafe { device.device_control(REQUEST_IOCTL_CODE, request, &mut output) };

    if status == Status::SUCCESS {
        return Ok(());
    }
    let message = &output[..information.saturating_sub(1)];
    Err(format!(
        "status {}: {}",
        status,
        String::from_utf8_lossy(message)
    ))
}

#[cfg(all(target_os = "linux", target_pointer_width = "64"))]
fn run_check(config: &CheckConfig) -> Result<(), String> {
    let device = ControlDevice::new(HostKernel::new());
    let mut encoder = RequestEncoder::new(1024);
    println!("🔌 Device {} ({})", device.name(), device.symbolic_link());

    // ALLOCATE
    let mut block = 0usize;
    encoder.reset();
    let request = encoder
        .encode_allocate(config.size, &mut block as *mut usize as usize)
        .ok_or("encoder buffer too small")?;
    submit(&device, request)?;
    println!("  Allocate:  {} bytes at {:#x}", config.size, block);

    // WRITE + READ back
    let pattern: Vec<u8> = (0..config.size.min(64)).map(|i| i as u8 ^ 0x5A).collect();
    let mut readback = vec![0u8; pattern.len()];
    encoder.reset();
    let request = encoder
        .encode_write(block, pattern.as_ptr() as usize, pattern.len() as u32)
        .ok_or("encoder buffer too small")?;
    submit(&device, request)?;

    encoder.reset();
    let request = encoder
        .encode_read(block, readback.as_mut_ptr() as usize, readback.len() as u32)
        .ok_or("encoder buffer too small")?;
    submit(&device, request)?;

    if readback != pattern {
        return Err("read back differs from written pattern".to_string());
    }
    println!("  Write/Read: {} bytes verified", pattern.len());

    // CALL_FUNCTION
    let mut result = 0i32;
    encoder.reset();
    let request = encoder
        .encode_call(
            &config.module,
            &config.routine,
            ScalarType::Sint32 as u8,
            &[],
            &mut result as *mut i32 as usize,
            &[],
        )
        .ok_or("module or routine name too long")?;
    submit(&device, request)?;
    println!("  Call:      {}!{}() = {}", config.module, config.routine, result);

    // FREE
    encoder.reset();
    let request = encoder.encode_free(block).ok_or("encoder buffer too small")?;
    submit(&device, request)?;
    println!("  Free:      {:#x}", block);

    Ok(())
}

#[cfg(not(all(target_os = "linux", target_pointer_width = "64")))]
fn run_check(_config: &CheckConfig) -> Result<(), String> {
    Err("no host kernel on this platform".to_string())
}

fn main() {
    let config = parse_args();

    let default_filter = if config.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    println!("🚀 kcall - Privileged Call Bridge v{}", env!("CARGO_PKG_VERSION"));
    println!("==========================================\n");

    if let Err(e) = run_check(&config) {
        eprintln!("❌ Self-check failed: {}", e);
        std::process::exit(1);
    }

    println!("\n✅ Self-check complete!");
}
