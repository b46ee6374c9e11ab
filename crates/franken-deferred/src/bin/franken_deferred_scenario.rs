#![forbid(unsafe_code)]

use std::fs;

use frankenengine_deferred::scenario::{load_scenario, render_summary, run_scenario};

fn main() {
    if let Err(error) = run(std::env::args().skip(1).collect()) {
        eprintln!("{error}");
        std::process::exit(2);
    }
}

fn run(args: Vec<String>) -> Result<(), String> {
    if args.is_empty() {
        return Err(usage());
    }

    match args[0].as_str() {
        "run" => run_command(&args[1..]),
        "help" | "--help" | "-h" => {
            println!("{}", usage());
            Ok(())
        }
        other => Err(format!("unknown subcommand '{other}'\n\n{}", usage())),
    }
}

fn usage() -> String {
    [
        "franken_deferred_scenario usage:",
        "  franken_deferred_scenario run --input <path> [--summary]",
        "",
        "Runs a JSON scenario on a fresh runtime and prints the report.",
    ]
    .join("\n")
}

fn run_command(args: &[String]) -> Result<(), String> {
    let mut input_path: Option<&str> = None;
    let mut summary = false;

    let mut index = 0usize;
    while index < args.len() {
        match args[index].as_str() {
            "--input" => {
                index += 1;
                let value = args
                    .get(index)
                    .ok_or_else(|| "--input requires a path".to_string())?;
                input_path = Some(value);
            }
            "--summary" => summary = true,
            flag => return Err(format!("unknown flag for run: {flag}")),
        }
        index += 1;
    }

    let path = input_path.ok_or_else(|| "missing required --input <path>".to_string())?;
    let raw = fs::read_to_string(path)
        .map_err(|error| format!("failed to read scenario input {path}: {error}"))?;
    let scenario = load_scenario(&raw).map_err(|error| error.to_string())?;
    let report = run_scenario(&scenario).map_err(|error| error.to_string())?;

    if summary {
        println!("{}", render_summary(&report));
    } else {
        println!(
            "{}",
            serde_json::to_string_pretty(&report)
                .map_err(|error| format!("failed to encode scenario report: {error}"))?
        );
    }
    Ok(())
}
