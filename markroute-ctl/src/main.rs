use exitcode::ExitCode;

use std::process;

use markroute_lib::command::{Command, Response};
use markroute_lib::component::CheckStatus;
use markroute_lib::socket;

mod cli;

#[tokio::main]
async fn main() {
    let args = cli::parse();

    let cmd: Command = args.command.into();
    let resp = match socket::process_cmd(&args.socket_path, &cmd).await {
        Ok(resp) => resp,
        Err(e) => {
            eprintln!("Error processing {cmd}: {e}");
            process::exit(exitcode::UNAVAILABLE);
        }
    };

    if args.json {
        json_print(&resp)
    } else {
        pretty_print(&resp)
    };

    process::exit(determine_exitcode(&resp));
}

fn json_print(resp: &Response) {
    match serde_json::to_string_pretty(resp) {
        Ok(s) => println!("{s}"),
        Err(e) => eprintln!("Error serializing response to JSON: {e}"),
    }
}

fn pretty_print(resp: &Response) {
    match resp {
        Response::Status(status) => {
            println!("running: {}", status.running);
            println!("version: {}", status.version);
            if let Some(fingerprint) = &status.fingerprint {
                println!("fingerprint: {fingerprint}");
            }
            for ipset in &status.ipsets {
                match &ipset.chosen_interface {
                    Some(interface) => println!("{}: via {interface}", ipset.name),
                    None => println!("{}: no egress", ipset.name),
                }
            }
        }
        Response::Check(reports) => {
            for report in reports {
                let status = match &report.status {
                    CheckStatus::Ok => "ok".to_string(),
                    CheckStatus::Missing => "MISSING".to_string(),
                    CheckStatus::Unexpected => "UNEXPECTED".to_string(),
                    CheckStatus::Error(e) => format!("ERROR: {e}"),
                };
                println!("[{status}] {}", report.description);
            }
        }
        Response::Reloaded => println!("configuration re-applied"),
        Response::RoutingRefreshed => println!("routing refreshed"),
        Response::Fingerprint(Some(fingerprint)) => println!("{fingerprint}"),
        Response::Fingerprint(None) => println!("service not running"),
        Response::ListsDownloaded => println!("lists downloaded and sets reloaded"),
        Response::Error(e) => eprintln!("Error: {e}"),
    }
}

fn determine_exitcode(resp: &Response) -> ExitCode {
    match resp {
        Response::Error(_) => exitcode::UNAVAILABLE,
        Response::Check(reports) => {
            let converged = reports
                .iter()
                .all(|r| matches!(r.status, CheckStatus::Ok));
            if converged { exitcode::OK } else { exitcode::TEMPFAIL }
        }
        _ => exitcode::OK,
    }
}
