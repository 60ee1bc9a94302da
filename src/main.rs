use geoflow::command::{builtin_script, CommandRegistry};
use std::process::exit;
use tracing::error;

fn main() {
    // the shipped binary registers only the built-in script entry point;
    // embedders build their own registry and call cli::run with it
    let mut registry = CommandRegistry::new();
    registry.register(builtin_script());

    if let Err(error) = geoflow::cli::run(&registry) {
        error!(error = ?error, "{error}");
        exit(1);
    }
}
