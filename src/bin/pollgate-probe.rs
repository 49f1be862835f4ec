use anyhow::{Context, Result};
use clap::{Arg, ArgAction, Command};
use log::info;

use pollgate::config::create_sample_config;
use pollgate::prober::{
    is_one_of_status, matches_all_of, matches_body, retrying_route_inconsistency,
    ResponseChecker,
};
use pollgate::{
    EndpointProber, InterruptRegistry, MetricRecorder, PollContext, ProbeRequest, Settings,
};

fn command() -> Command {
    Command::new("pollgate-probe")
        .version("0.1.0")
        .about("Poll an HTTP endpoint until it answers with the expected response")
        .arg(
            Arg::new("url")
                .short('u')
                .long("url")
                .value_name("URL")
                .help("Logical URL to probe")
                .required_unless_present("sample-config"),
        )
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("config/pollgate.toml"),
        )
        .arg(
            Arg::new("sample-config")
                .long("sample-config")
                .value_name("FILE")
                .help("Write a sample configuration file and exit"),
        )
        .arg(
            Arg::new("expect-status")
                .long("expect-status")
                .value_name("CODE")
                .help("Status code that ends the poll")
                .default_value("200"),
        )
        .arg(
            Arg::new("body")
                .long("body")
                .value_name("TEXT")
                .help("Text the response body must contain"),
        )
        .arg(
            Arg::new("retry-inconsistency")
                .long("retry-inconsistency")
                .help("Keep polling on 404 and 503 while a route propagates")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("ingress")
                .long("ingress")
                .value_name("HOST:PORT")
                .help("Ingress endpoint used when the domain is not resolvable"),
        )
        .arg(
            Arg::new("resolvable-domain")
                .long("resolvable-domain")
                .value_name("BOOL")
                .help("Whether the URL's domain resolves from here"),
        )
        .arg(
            Arg::new("emit-metrics")
                .long("emit-metrics")
                .value_name("BOOL")
                .help("Print metric lines for completed polls"),
        )
        .arg(
            Arg::new("docker-repo")
                .long("docker-repo")
                .value_name("PATH")
                .help("Registry prefix for test images"),
        )
        .arg(
            Arg::new("interval-ms")
                .long("interval-ms")
                .value_name("MILLIS")
                .help("Delay between attempts"),
        )
        .arg(
            Arg::new("timeout-ms")
                .long("timeout-ms")
                .value_name("MILLIS")
                .help("Give up after this long"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable debug logging")
                .action(ArgAction::SetTrue),
        )
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = command().get_matches();

    if let Some(path) = matches.get_one::<String>("sample-config") {
        return create_sample_config(path);
    }

    let config_path = matches.get_one::<String>("config");
    let settings = Settings::load_with_cli(config_path.map(|s| s.as_str()), &matches)?;
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(settings.log_level()))
        .init();

    let url = matches
        .get_one::<String>("url")
        .context("--url is required")?;
    let expected_status = matches
        .get_one::<String>("expect-status")
        .map(|s| s.parse::<u16>())
        .transpose()
        .context("--expect-status must be an HTTP status code")?
        .unwrap_or(200);

    let registry = InterruptRegistry::new();
    registry.init();

    let recorder = if settings.emit_metrics {
        MetricRecorder::stdout()
    } else {
        MetricRecorder::disabled()
    };
    let ctx = PollContext::new("pollgate-probe").with_recorder(recorder);
    let prober = EndpointProber::from_settings(&settings)?;
    let request = ProbeRequest::get(url)?;

    let mut checkers: Vec<ResponseChecker> = vec![Box::new(is_one_of_status(&[expected_status]))];
    if let Some(body) = matches.get_one::<String>("body") {
        checkers.push(Box::new(matches_body(body)));
    }
    let all = matches_all_of(checkers);

    info!("Probing {url} via {:?}", prober.target());
    let result = if matches.get_flag("retry-inconsistency") {
        prober
            .poll(&ctx, &request, "probe", retrying_route_inconsistency(all))
            .await
    } else {
        prober.poll(&ctx, &request, "probe", all).await
    };

    registry.shutdown();
    match result {
        Ok(response) => {
            info!("{url} answered {}", response.status);
            println!("{}", response.text());
            Ok(())
        }
        Err(e) => {
            log::error!("Probe failed: {e}");
            std::process::exit(1);
        }
    }
}
