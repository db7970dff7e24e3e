use std::io::{self, Write};
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use fetchpool::config::{Cli, Command, FetchArgs, RunArgs};
use fetchpool::task::Runner;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // stdout is reserved to fetched bodies and task outputs
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let succeeded = match cli.command {
        Command::Fetch(args) => fetch(&args, &mut io::stdout()).await,
        Command::Run(args) => Ok(run(args).await),
    };

    match succeeded {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            tracing::error!("Cannot write output: {err}");
            ExitCode::FAILURE
        }
    }
}

/// Print the fetched body, or the failure reason instead, returning whether the fetch succeeded.
async fn fetch(args: &FetchArgs, out: &mut impl Write) -> io::Result<bool> {
    let result = match args.fetcher() {
        Ok(fetcher) => fetcher.get(args.url.as_str()).await,
        Err(err) => Err(err),
    };

    match result {
        Ok(html) => {
            writeln!(out, "{html}")?;
            Ok(true)
        }
        Err(err) => {
            writeln!(out, "{}", err.reason())?;
            Ok(false)
        }
    }
}

async fn run(args: RunArgs) -> bool {
    let runner = Runner::new(args.workers);

    match runner.run(0..args.count, |i| println!("{i}")).await {
        Ok(()) => true,
        Err(err) => {
            tracing::error!("{err}");

            for (index, failure) in err.failures() {
                tracing::error!("Task #{index}: {failure}");
            }

            false
        }
    }
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{header, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    async fn server() -> MockServer {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(header("authorization", "Basic YWRtaW46YWRtaW4="))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>scraped</html>"))
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401).insert_header("WWW-Authenticate", r#"Basic realm="Admin""#))
            .with_priority(10)
            .mount(&server)
            .await;

        server
    }

    fn args(url: &str, password: &str) -> FetchArgs {
        let cli = Cli::try_parse_from(["fetchpool", "fetch", url, "--username", "admin", "--password", password]).unwrap();

        match cli.command {
            Command::Fetch(args) => args,
            Command::Run(_) => panic!("expected fetch"),
        }
    }

    #[tokio::test]
    async fn test_fetch_prints_body() {
        let server = server().await;
        let mut out = vec![];

        assert!(fetch(&args(&server.uri(), "admin"), &mut out).await.unwrap());
        assert_eq!(String::from_utf8(out).unwrap(), "<html>scraped</html>\n");
    }

    #[tokio::test]
    async fn test_fetch_prints_reason() {
        let server = server().await;
        let mut out = vec![];

        assert!(!fetch(&args(&server.uri(), "wrong"), &mut out).await.unwrap());
        assert_eq!(String::from_utf8(out).unwrap(), "401 Unauthorized\n");
    }

    #[tokio::test]
    async fn test_fetch_prints_invalid_url_reason() {
        let mut out = vec![];

        assert!(!fetch(&args("relative/path", "admin"), &mut out).await.unwrap());
        assert!(String::from_utf8(out).unwrap().starts_with("invalid URL"));
    }

    #[tokio::test]
    async fn test_run_succeeds() {
        let args = RunArgs {
            workers: 2.try_into().unwrap(),
            count: 4,
        };

        assert!(run(args).await);
    }
}
