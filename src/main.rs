use std::time::Duration;

use toolhost::cli;
use toolhost::core::terminal;

fn main() {
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            terminal::print_error(&format!("failed to start async runtime: {}", e));
            std::process::exit(1);
        }
    };

    let result = runtime.block_on(cli::run_main());
    // A parked stdin read must not hold the process open.
    runtime.shutdown_timeout(Duration::from_secs(2));

    if let Err(e) = result {
        terminal::print_error(&format!("{:#}", e));
        std::process::exit(1);
    }
}
