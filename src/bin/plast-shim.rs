//! The compiler-replacement binary (spec §4.11). Installed under the name
//! of a real compiler (or invoked with `PLAST_COMPILER` set) so that build
//! systems calling `cc`/`g++`/etc. transparently go through the farm.

fn main() {
    env_logger::init();

    let argv: Vec<std::ffi::OsString> = std::env::args_os().collect();

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("plast-shim: failed to start the async runtime: {}", e);
            std::process::exit(127);
        }
    };

    let exit_status = runtime.block_on(plast::shim::run(argv));
    std::process::exit(exit_status);
}
