use codecache::cli;

fn main() -> anyhow::Result<()> {
    if let Err(e) = cli::run() {
        eprintln!("Error: {:?}", e);
        std::process::exit(1);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::Parser;
    use codecache::cli::{CodeCacheCli, Command};

    #[test]
    fn inspect_command_honors_json_flag() {
        let cli = CodeCacheCli::parse_from(["codecache", "inspect", "app.ccache", "--json"]);
        match cli.command() {
            Command::Inspect { path, json } => {
                assert_eq!(path.to_string_lossy(), "app.ccache");
                assert!(*json);
            }
            other => panic!("expected inspect command, got {other:?}"),
        }
    }

    #[test]
    fn config_accepts_an_application_name() {
        let cli = CodeCacheCli::parse_from(["codecache", "config", "--app", "petclinic"]);
        assert!(matches!(
            cli.command(),
            Command::Config { app: Some(app) } if app == "petclinic"
        ));
    }

    #[test]
    fn verbosity_is_global() {
        let cli = CodeCacheCli::parse_from(["codecache", "verify", "app.ccache", "-vv"]);
        assert!(matches!(cli.command(), Command::Verify { .. }));
    }
}
