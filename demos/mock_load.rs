use std::io::stdout;
use std::sync::Arc;

use stampede::{
    JsonLinesConsumer, LoadDriver, SamplingConsumer, config::DriverConfiguration, logging,
    registry::PluginRegistry,
};

const CONFIGURATION: &str = r#"
load:
  load_strategy: mock
  thread_count: 4
  duration_ms: 3000
  key_count: 1000
  properties:
    failure_every: 10
    latency_ms: 2
service:
  service_type: mock
sampler:
  sampling_interval_ms: 1000
  sampling_task_run_interval_ms: 100
  metrics: [load_average, memory]
  consumers: [log]
"#;

fn main() -> stampede::Result<()> {
    logging::init_default();

    // Pass a path to run your own configuration
    let configuration = match std::env::args().nth(1) {
        Some(path) => DriverConfiguration::from_path(path)?,
        None => DriverConfiguration::from_yaml_str(CONFIGURATION)?,
    };
    let driver = LoadDriver::init(configuration, &PluginRegistry::with_builtins())?;

    // Intervals also go to stdout as JSON lines
    let json: Arc<dyn SamplingConsumer> = Arc::new(JsonLinesConsumer::new(stdout()));
    driver.sampler().register_consumer(json);

    driver.run()?;

    for (thread, count) in driver.runner().per_thread_invocation_counts() {
        println!("{thread}: {count} operations");
    }
    Ok(())
}
