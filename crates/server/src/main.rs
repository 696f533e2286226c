mod app;
mod content;

use std::process::ExitCode;

use tracing::error;

fn main() -> ExitCode {
    match app::build_app() {
        Ok(wiring) => app::run(wiring),
        Err(err) => {
            error!(error = %err, "startup_failed");
            ExitCode::FAILURE
        }
    }
}
