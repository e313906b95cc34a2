//! Entry point for the `vigil` training daemon.
use std::io::BufRead;
use std::sync::Arc;

use vigil::clock::{Clock, SystemClock};
use vigil::logging;
use vigil::orchestrator::TrainingOrchestrator;
use vigil::resources::{ResourceMonitor, SystemProbe};
use vigil::service::TrainingService;
use vigil::settings;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let settings = settings::load_or_default()?;
    settings.validate()?;
    if let Err(err) = logging::init(&settings.logging) {
        eprintln!("Logging disabled: {err}");
    }

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let monitor = ResourceMonitor::new(
        Arc::new(SystemProbe::new()),
        Arc::clone(&clock),
        settings.resources.clone(),
    );
    let orchestrator = TrainingOrchestrator::open(settings, monitor, clock)?;
    let service = TrainingService::start(orchestrator)?;

    // Runs until stdin closes or `quit` is entered.
    for line in std::io::stdin().lock().lines() {
        match line?.trim() {
            "quit" | "exit" => break,
            "train" => {
                if let Some(outcome) = service.train_now() {
                    println!("{outcome:?}");
                }
            }
            "metrics" => println!("{}", serde_json::to_string_pretty(&service.training_metrics())?),
            "" => {}
            other => eprintln!("unknown command `{other}` (train, metrics, quit)"),
        }
    }
    service.shutdown();
    Ok(())
}
