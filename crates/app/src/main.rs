use std::process;

mod commands;
mod logging;

fn main() {
    let args: Vec<String> = std::env::args().collect();
    logging::setup_tracing(logging::level_from_args(&args));

    if let Err(err) = commands::run(&args) {
        eprintln!("raymerge: {err}");
        process::exit(1);
    }
}
