use std::io::Write;
use std::process::ExitCode;

use futures_util::io::empty;

use fastcgi_client::client::Connection;
use fastcgi_client::protocol::ProtocolVariables;
use fastcgi_client::{cgi, Config};


const USAGE: &str = "usage: fcgi-get <tcp|tcp4|tcp6|unix> <address> <script> [query]";

/// Builds the CGI/1.1 environment of a plain GET request for `script`.
fn get_params(script: &str, query: &str) -> cgi::Params {
    let mut params = cgi::Params::with_capacity(12);
    params.append(cgi::GATEWAY_INTERFACE, "CGI/1.1");
    params.append(cgi::SERVER_PROTOCOL, "HTTP/1.1");
    params.append(cgi::SERVER_SOFTWARE, "fcgi-get");
    params.append(cgi::SERVER_NAME, "localhost");
    params.append(cgi::REQUEST_METHOD, "GET");
    params.append(cgi::SCRIPT_FILENAME, script);
    params.append(cgi::SCRIPT_NAME, script);
    params.append(cgi::QUERY_STRING, query);
    params.append(cgi::CONTENT_LENGTH, "0");
    params.append(cgi::REQUEST_URI, if query.is_empty() {
        script.to_owned()
    } else {
        format!("{script}?{query}")
    });
    params.append_header("Host", "localhost");
    params.append_header("User-Agent", "fcgi-get");
    params
}

// A single request at a time needs no more than the current-thread runtime
#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let [network, address, script, rest @ ..] = &args[..] else {
        eprintln!("{USAGE}");
        return ExitCode::FAILURE;
    };
    let query = rest.first().map_or("", String::as_str);

    match run(network, address, script, query).await {
        Ok(code) => code,
        Err(e) => {
            let error: &dyn std::error::Error = &*e;
            tracing::error!(error, "FastCGI request failed");
            ExitCode::FAILURE
        },
    }
}

async fn run(
    network: &str,
    address: &str,
    script: &str,
    query: &str,
) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let conn = Connection::dial_with(network, address, Config::default()).await?;

    // Not every responder understands management records, so failure is fine
    match conn.get_values(ProtocolVariables::all()).await {
        Ok(values) => tracing::info!(?values, "responder limits"),
        Err(e) => tracing::info!(error = %e, "responder did not report its limits"),
    }

    let params = get_params(script, query);
    let request = conn.begin_request(&params, empty(), Vec::new(), Vec::new()).await?;
    let app_status = request.wait().await?;
    tracing::debug!(app_status, "request ended");

    let (stdout, stderr) = request.into_output().map_err(|_| "request output still in use")?;
    conn.close().await?;

    if !stderr.is_empty() {
        std::io::stderr().write_all(&stderr)?;
    }
    let response = cgi::Response::parse(&stdout)?.into_http();

    let mut out = std::io::stdout().lock();
    writeln!(out, "{:?} {}", response.version(), response.status())?;
    for (name, value) in response.headers() {
        write!(out, "{name}: ")?;
        out.write_all(value.as_bytes())?;
        writeln!(out)?;
    }
    writeln!(out)?;
    out.write_all(response.body())?;
    out.flush()?;

    Ok(if response.status().is_success() { ExitCode::SUCCESS } else { ExitCode::from(2) })
}


/// Sets up a basic `tracing` subscriber to stderr. Its verbosity level is
/// configured with the `RUST_LOG` environment variable.
fn init_tracing() {
    use tracing_subscriber::{filter::LevelFilter, fmt};
    let max_level = match std::env::var("RUST_LOG") {
        Ok(var) if !var.is_empty() => match var.parse::<LevelFilter>() {
            Ok(f) => f,
            Err(e) => {
                eprintln!("Ignoring `RUST_LOG={var}`: {e}");
                LevelFilter::INFO
            },
        },
        Ok(_) | Err(std::env::VarError::NotPresent) => LevelFilter::INFO,
        Err(e) => {
            eprintln!("Ignoring `RUST_LOG`: {e}");
            LevelFilter::INFO
        },
    };

    fmt::fmt()
        .with_timer(fmt::time::uptime())
        .with_max_level(max_level)
        .with_writer(std::io::stderr)
        .init();
}
