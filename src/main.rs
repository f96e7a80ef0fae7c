mod config;
mod connector;
mod deadline;
mod error;
mod report;
mod request;
mod runner;
mod worker;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use config::Cli;
use request::Request;
use runner::Runner;

const EXIT_CONFIG_ERROR: i32 = 2;

fn main() {
    tracing_subscriber
        ::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
        )
        .with_writer(std::io::stderr)
        .init();

    let (config, url) = Cli::parse().into_config();

    let request = match Request::build(&url, &config) {
        Ok(request) => request,
        Err(err) => {
            eprintln!("{}", err);
            std::process::exit(EXIT_CONFIG_ERROR);
        }
    };

    println!(
        "Running {}s test: {} {} ({}) on {}",
        config.duration.as_secs(),
        request.method(),
        url,
        request.version(),
        request.target()
    );
    print!("{} client(s)", config.clients);
    if !config.wait_for_response {
        print!(", not waiting for responses");
    }
    if let Some(proxy) = &config.proxy {
        print!(", via proxy server {}", proxy);
    }
    if config.force_reload {
        print!(", forcing reload");
    }
    println!(".");

    let runner = Runner::new(config, request);

    let runner_clone = runner.clone();
    if let Err(err) = ctrlc::set_handler(move || runner_clone.interrupt()) {
        tracing::warn!(error = %err, "Failed to set Ctrl+C handler");
    }

    match runner.run() {
        Ok(report) => report.print_report(),
        Err(err) => {
            eprintln!("{}", err);
            std::process::exit(err.exit_code());
        }
    }
}
