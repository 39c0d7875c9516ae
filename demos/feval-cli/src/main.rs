//! Call one Octave function from the command line.
//!
//! Run with: cargo run -p feval-cli -- zeros 3
//!
//! Arguments are JSON documents (`3`, `"text"`, `[[1,2],[3,4]]`,
//! `{"a": 1}`); outputs are printed as JSON, one per line.

use std::time::Duration;

use clap::Parser;
use octbridge_core::{CommandRequest, Nout, SessionConfig, Value};
use octbridge_session::Session;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug, Clone)]
#[command(name = "feval-cli", about = "Call one Octave function", version)]
struct Cli {
    /// Function to call, or code to evaluate with `--eval`.
    #[arg(value_name = "FUNCTION")]
    target: String,

    /// Arguments as JSON; bare words are taken as text.
    #[arg(value_name = "ARG", value_parser = parse_json_arg, allow_negative_numbers = true)]
    args: Vec<Value>,

    /// Outputs to keep (`max` for all declared outputs).
    #[arg(long, default_value = "1", value_parser = parse_nout)]
    nout: Nout,

    /// Interrupt the call after this many seconds.
    #[arg(long, value_name = "SECONDS", value_parser = parse_timeout)]
    timeout: Option<Duration>,

    /// Treat FUNCTION as code to evaluate.
    #[arg(long)]
    eval: bool,

    /// Show engine output.
    #[arg(long)]
    log: bool,
}

fn parse_json_arg(raw: &str) -> Result<Value, String> {
    let json: serde_json::Value = serde_json::from_str(raw)
        .unwrap_or_else(|_| serde_json::Value::String(raw.to_string()));
    Value::from_json(&json).map_err(|e| e.to_string())
}

fn parse_nout(raw: &str) -> Result<Nout, String> {
    if raw == "max" {
        return Ok(Nout::Max);
    }
    raw.parse()
        .map(Nout::Count)
        .map_err(|_| format!("expected a count or `max`, got {raw:?}"))
}

fn parse_timeout(raw: &str) -> Result<Duration, String> {
    let secs: f64 = raw.parse().map_err(|_| format!("not a number: {raw:?}"))?;
    Duration::try_from_secs_f64(secs).map_err(|e| e.to_string())
}

impl Cli {
    fn request(self) -> CommandRequest {
        let request = if self.eval {
            CommandRequest::eval(self.target)
        } else {
            CommandRequest::call(self.target).args(self.args)
        };
        let request = request.nout(self.nout);
        match self.timeout {
            Some(timeout) => request.timeout(timeout),
            None => request,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn,octbridge::engine=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let session = Session::new(SessionConfig::new().with_logging(cli.log));

    let outcome = session.execute(cli.request()).await;
    session.close().await?;
    let outcome = outcome?;
    tracing::debug!(values = outcome.values.len(), "call finished");

    for value in &outcome.values {
        println!("{}", serde_json::to_string(&value.to_json())?);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Cli, clap::Error> {
        Cli::try_parse_from(std::iter::once("feval-cli").chain(args.iter().copied()))
    }

    #[test]
    fn test_parse_options_and_json_args() {
        let cli = parse(&["--nout", "2", "--timeout", "1.5", "size", "[[1,2,3],[4,5,6]]"]).unwrap();
        assert_eq!(cli.target, "size");
        assert_eq!(cli.nout, Nout::Count(2));
        assert_eq!(cli.timeout, Some(Duration::from_millis(1500)));
        assert_eq!(cli.args.len(), 1);
        assert_eq!(cli.args[0].as_numeric().unwrap().dims(), &[2, 3]);
        assert!(!cli.eval && !cli.log);
    }

    #[test]
    fn test_bare_words_are_text() {
        let cli = parse(&["--nout", "max", "upper", "hello", "-3"]).unwrap();
        assert_eq!(cli.args, vec![Value::from("hello"), Value::from(-3.0)]);
        assert_eq!(cli.nout, Nout::Max);
    }

    #[test]
    fn test_eval_request() {
        let cli = parse(&["--eval", "--nout", "0", "x = 1;"]).unwrap();
        assert!(cli.eval);
        assert_eq!(cli.request().requested_nout(), Nout::Count(0));
    }

    #[test]
    fn test_errors() {
        assert!(parse(&[]).is_err());
        assert!(parse(&["f", "--nout"]).is_err());
        assert!(parse(&["--nout", "many", "f"]).is_err());
        assert!(parse(&["--timeout", "soon", "f"]).is_err());
    }
}
