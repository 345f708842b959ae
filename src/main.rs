#[macro_use]
extern crate clap;

#[macro_use]
extern crate slog;

use clap::ArgAction;
use clap_complete::{generate, Shell};
use slog::Drain;
use std::io;

use codestory::config::{ConfigScope, Overrides};
use codestory::errors::CancelToken;

fn cli() -> clap::Command {
    command!()
        .about("Rewrite unstructured changes into atomic, logically grouped commits")
        .arg(
            clap::Arg::new("model")
                .help("Model provider and name, e.g. openai:gpt-4o-mini or heuristic")
                .long("model")
                .global(true),
        )
        .arg(
            clap::Arg::new("api-key")
                .help("API key for the model provider")
                .long("api-key")
                .global(true),
        )
        .arg(
            clap::Arg::new("api-base")
                .help("Base URL of the OpenAI-compatible endpoint")
                .long("api-base")
                .global(true),
        )
        .arg(
            clap::Arg::new("temperature")
                .help("Sampling temperature (0-1)")
                .long("temperature")
                .value_parser(clap::value_parser!(f32))
                .global(true),
        )
        .arg(
            clap::Arg::new("max-tokens")
                .help("Token budget per model request")
                .long("max-tokens")
                .value_parser(clap::value_parser!(u32))
                .global(true),
        )
        .arg(
            clap::Arg::new("relevance-filtering")
                .help("Drop groups unrelated to the stated intent")
                .long("relevance-filtering")
                .action(ArgAction::SetTrue)
                .global(true),
        )
        .arg(
            clap::Arg::new("relevance-filter-similarity-threshold")
                .help("Minimum intent similarity (0-1)")
                .long("relevance-filter-similarity-threshold")
                .value_parser(clap::value_parser!(f32))
                .global(true),
        )
        .arg(
            clap::Arg::new("secret-scanner-aggression")
                .help("Secret scanner level")
                .long("secret-scanner-aggression")
                .value_parser(["none", "safe", "standard", "strict"])
                .global(true),
        )
        .arg(
            clap::Arg::new("fallback-grouping-strategy")
                .help("Grouping for files without a syntax tree")
                .long("fallback-grouping-strategy")
                .value_parser(["all_together", "by_file", "by_extension"])
                .global(true),
        )
        .arg(
            clap::Arg::new("chunking-level")
                .help("How finely hunks are split into chunks")
                .long("chunking-level")
                .value_parser(["none", "full_files", "all_files"])
                .global(true),
        )
        .arg(
            clap::Arg::new("custom-language-config")
                .help("Path to a JSON language configuration")
                .long("custom-language-config")
                .value_name("PATH")
                .global(true),
        )
        .arg(
            clap::Arg::new("cluster-strictness")
                .help("How aggressively the model merges groups (0-1)")
                .long("cluster-strictness")
                .value_parser(clap::value_parser!(f32))
                .global(true),
        )
        .arg(
            clap::Arg::new("batching-strategy")
                .help("Model request batching")
                .long("batching-strategy")
                .value_parser(["auto", "requests", "prompt"])
                .global(true),
        )
        .arg(
            clap::Arg::new("num-retries")
                .help("Model retries before the heuristic fallback (0-10)")
                .long("num-retries")
                .value_parser(clap::value_parser!(u32))
                .global(true),
        )
        .arg(
            clap::Arg::new("fail-on-syntax-errors")
                .help("Treat parse errors as fatal and reject broken groups")
                .long("fail-on-syntax-errors")
                .action(ArgAction::SetTrue)
                .global(true),
        )
        .arg(
            clap::Arg::new("ask-for-commit-message")
                .help("Prompt for every commit message")
                .long("ask-for-commit-message")
                .action(ArgAction::SetTrue)
                .global(true),
        )
        .arg(
            clap::Arg::new("display-diff-type")
                .help("Preview rendering")
                .long("display-diff-type")
                .value_parser(["semantic", "git"])
                .global(true),
        )
        .arg(
            clap::Arg::new("auto-accept")
                .help("Skip the confirmation prompt")
                .long("auto-accept")
                .action(ArgAction::SetTrue)
                .global(true),
        )
        .arg(
            clap::Arg::new("silent")
                .help("Only report errors")
                .long("silent")
                .action(ArgAction::SetTrue)
                .global(true),
        )
        .arg(
            clap::Arg::new("verbose")
                .help("Display more output")
                .short('v')
                .long("verbose")
                .action(ArgAction::SetTrue)
                .global(true),
        )
        .arg(
            clap::Arg::new("custom-embedding-model")
                .help("Embedding backend for relevance filtering")
                .long("custom-embedding-model")
                .global(true),
        )
        .arg(
            clap::Arg::new("config-file")
                .help("Explicit JSON config file, overriding git config and environment")
                .long("config-file")
                .value_name("PATH")
                .global(true),
        )
        .arg(
            clap::Arg::new("gen-completions")
                .help("Generate completions")
                .long("gen-completions")
                .value_parser(["bash", "fish", "zsh", "powershell", "elvish"]),
        )
        .subcommand(
            clap::Command::new("commit")
                .about("Split the working tree changes into logical commits")
                .arg(
                    clap::Arg::new("pathspec")
                        .help("Limit the commit to these paths")
                        .num_args(0..),
                )
                .arg(
                    clap::Arg::new("intent")
                        .help("What this change set is trying to do")
                        .long("intent")
                        .value_name("STRING"),
                ),
        )
        .subcommand(
            clap::Command::new("fix")
                .about("Rewrite an existing commit into logical commits with the same tree")
                .arg(clap::Arg::new("rev").help("The commit to rewrite").required(true)),
        )
        .subcommand(
            clap::Command::new("clean")
                .about("Rewrite the linear history below a commit, stopping at merges")
                .arg(clap::Arg::new("rev").help("Start from this commit instead of HEAD"))
                .arg(
                    clap::Arg::new("min-size")
                        .help("Keep commits with fewer chunks than this as they are")
                        .long("min-size")
                        .value_name("N")
                        .value_parser(clap::value_parser!(usize))
                        .default_value("0"),
                ),
        )
        .subcommand(
            clap::Command::new("config")
                .about("Read or write codestory configuration keys")
                .arg(clap::Arg::new("key").help("Configuration key, e.g. model"))
                .arg(clap::Arg::new("value").help("New value for the key"))
                .arg(
                    clap::Arg::new("scope")
                        .help("Which git config file to write")
                        .long("scope")
                        .value_parser(["local", "global"])
                        .default_value("local"),
                )
                .arg(
                    clap::Arg::new("delete")
                        .help("Delete the key")
                        .long("delete")
                        .action(ArgAction::SetTrue),
                )
                .arg(
                    clap::Arg::new("deleteall")
                        .help("Delete every codestory key")
                        .long("deleteall")
                        .action(ArgAction::SetTrue),
                )
                .arg(
                    clap::Arg::new("describe")
                        .help("List the known keys")
                        .long("describe")
                        .action(ArgAction::SetTrue),
                ),
        )
}

fn flag(matches: &clap::ArgMatches, name: &str) -> Option<bool> {
    if matches.get_flag(name) {
        Some(true)
    } else {
        None
    }
}

fn overrides_from(matches: &clap::ArgMatches, intent: Option<String>) -> Overrides {
    Overrides {
        model: matches.get_one::<String>("model").cloned(),
        api_key: matches.get_one::<String>("api-key").cloned(),
        api_base: matches.get_one::<String>("api-base").cloned(),
        temperature: matches.get_one::<f32>("temperature").copied(),
        max_tokens: matches.get_one::<u32>("max-tokens").copied(),
        relevance_filtering: flag(matches, "relevance-filtering"),
        relevance_filter_similarity_threshold: matches
            .get_one::<f32>("relevance-filter-similarity-threshold")
            .copied(),
        secret_scanner_aggression: matches
            .get_one::<String>("secret-scanner-aggression")
            .cloned(),
        fallback_grouping_strategy: matches
            .get_one::<String>("fallback-grouping-strategy")
            .cloned(),
        chunking_level: matches.get_one::<String>("chunking-level").cloned(),
        cluster_strictness: matches.get_one::<f32>("cluster-strictness").copied(),
        batching_strategy: matches.get_one::<String>("batching-strategy").cloned(),
        num_retries: matches.get_one::<u32>("num-retries").copied(),
        fail_on_syntax_errors: flag(matches, "fail-on-syntax-errors"),
        ask_for_commit_message: flag(matches, "ask-for-commit-message"),
        display_diff_type: matches.get_one::<String>("display-diff-type").cloned(),
        auto_accept: flag(matches, "auto-accept"),
        silent: flag(matches, "silent"),
        verbose: flag(matches, "verbose"),
        custom_embedding_model: matches.get_one::<String>("custom-embedding-model").cloned(),
        custom_language_config: matches.get_one::<String>("custom-language-config").cloned(),
        intent,
    }
}

fn run_config_command(matches: &clap::ArgMatches) -> codestory::errors::Result<()> {
    use codestory::config;

    let repo = git2::Repository::open_from_env()?;
    let scope = match matches.get_one::<String>("scope").map(|s| s.as_str()) {
        Some("global") => ConfigScope::Global,
        _ => ConfigScope::Local,
    };

    if matches.get_flag("describe") {
        for key in config::KEYS {
            println!("{:<40} {}", key.name, key.description);
        }
        return Ok(());
    }
    if matches.get_flag("deleteall") {
        return config::config_delete_all(&repo, scope);
    }

    let key = match matches.get_one::<String>("key") {
        Some(key) => key,
        None => {
            for key in config::KEYS {
                if let Some(value) = config::config_get(&repo, key.name)? {
                    println!("{} = {}", key.name, value);
                }
            }
            return Ok(());
        }
    };

    if matches.get_flag("delete") {
        return config::config_delete(&repo, key, scope);
    }
    match matches.get_one::<String>("value") {
        Some(value) => config::config_set(&repo, key, value, scope),
        None => {
            match config::config_get(&repo, key)? {
                Some(value) => println!("{}", value),
                None => println!("{} is not set", key),
            }
            Ok(())
        }
    }
}

fn main() {
    let mut command = cli();
    let args = command.clone().get_matches();

    if let Some(shell) = args.get_one::<String>("gen-completions") {
        let app_name = "codestory";
        let shell = match shell.as_str() {
            "bash" => Shell::Bash,
            "fish" => Shell::Fish,
            "zsh" => Shell::Zsh,
            "powershell" => Shell::PowerShell,
            "elvish" => Shell::Elvish,
            _ => unreachable!(),
        };
        generate(shell, &mut command, app_name, &mut io::stdout());
        return;
    }

    let verbose = args.get_flag("verbose");
    let silent = args.get_flag("silent");
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    let drain = slog::LevelFilter::new(
        drain,
        if silent {
            slog::Level::Error
        } else if verbose {
            slog::Level::Debug
        } else {
            slog::Level::Info
        },
    )
    .fuse();
    let mut logger = slog::Logger::root(drain, o!());
    if verbose {
        logger = logger.new(o!(
            "module" => slog::FnValue(|record| record.module()),
            "line" => slog::FnValue(|record| record.line()),
        ));
    }

    let (mode, sub_matches) = match args.subcommand() {
        Some(("config", sub)) => {
            if let Err(e) = run_config_command(sub) {
                crit!(logger, "config failed"; "err" => e.to_string());
                drop(logger);
                std::process::exit(e.exit_code());
            }
            return;
        }
        Some(("commit", sub)) => (
            codestory::Mode::Commit {
                pathspecs: sub
                    .get_many::<String>("pathspec")
                    .map(|values| values.cloned().collect())
                    .unwrap_or_default(),
            },
            Some(sub),
        ),
        Some(("fix", sub)) => (
            codestory::Mode::Fix {
                rev: sub.get_one::<String>("rev").expect("rev is required").clone(),
            },
            Some(sub),
        ),
        Some(("clean", sub)) => (
            codestory::Mode::Clean {
                rev: sub.get_one::<String>("rev").cloned(),
                min_size: *sub.get_one::<usize>("min-size").expect("has a default"),
            },
            Some(sub),
        ),
        _ => (codestory::Mode::Commit { pathspecs: vec![] }, None),
    };

    let intent = sub_matches
        .and_then(|sub| {
            if sub.try_contains_id("intent").unwrap_or(false) {
                sub.get_one::<String>("intent").cloned()
            } else {
                None
            }
        });
    let effective = sub_matches.unwrap_or(&args);
    let cli_overrides = overrides_from(effective, intent);
    let config_file = effective
        .get_one::<String>("config-file")
        .map(std::path::PathBuf::from);

    let token = CancelToken::new();
    {
        let token = token.clone();
        let _ = ctrlc::set_handler(move || token.cancel());
    }

    let config = codestory::Config {
        mode,
        cli: cli_overrides,
        config_file,
        token,
    };

    if let Err(e) = codestory::run(&logger, &config) {
        crit!(logger, "codestory failed"; "err" => e.to_string());
        // wait for the async logger to finish writing messages
        let code = e.exit_code();
        drop(logger);
        std::process::exit(code);
    }
}
