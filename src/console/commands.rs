//! Supervisor command parsing and the nsenter-backed one-shot exec.

use std::process::Command as ProcessCommand;

use nix::unistd::Pid;

use super::frame;
use crate::container::canonical_id;

/// Everything the supervisor prompt understands.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    NewPod,
    NewJoiners { letter: char, count: u32 },
    List,
    ListPod(char),
    Attach(String),
    ExecOne { id: String, cmd: String },
    ExecAll { cmd: String },
    ExecExcept { id: String, cmd: String },
    Run { letter: Option<char>, cmd: String },
    Kill { letter: char, index: Option<u32> },
    Forward { target: String, port: u16 },
    Clear,
    Help,
    Exit,
}

fn parse_letter(arg: &str) -> Result<char, String> {
    let mut chars = arg.chars();
    match (chars.next(), chars.next()) {
        (Some(letter), None) if letter.is_ascii_lowercase() => Ok(letter),
        _ => Err(format!("[-] Invalid pod letter: {}", arg)),
    }
}

/// Parses one prompt line. Errors are user-facing usage strings.
pub fn parse(input: &str) -> Result<Command, String> {
    let input = input.trim();

    if let Some(rest) = input.strip_prefix(':') {
        let mut parts = rest.splitn(2, ' ');
        let target = parts.next().unwrap_or("");
        let cmd = parts.next().unwrap_or("").trim().to_string();
        if target.is_empty() || cmd.is_empty() {
            return Err("[-] Usage: :<id> <command> | :* <command> | :!<id> <command>".to_string());
        }
        return Ok(if target == "*" {
            Command::ExecAll { cmd }
        } else if let Some(excluded) = target.strip_prefix('!') {
            Command::ExecExcept {
                id: canonical_id(excluded),
                cmd,
            }
        } else {
            Command::ExecOne {
                id: canonical_id(target),
                cmd,
            }
        });
    }

    let words: Vec<&str> = input.split_whitespace().collect();
    let (head, args) = match words.split_first() {
        Some(split) => split,
        None => return Err(String::new()),
    };

    match (*head, args) {
        ("new", []) | ("n", []) => Ok(Command::NewPod),
        ("new", rest) | ("n", rest) => {
            let letter = parse_letter(rest[0])?;
            let count = match rest.get(1) {
                Some(n) => n
                    .parse::<u32>()
                    .ok()
                    .filter(|n| *n > 0)
                    .ok_or_else(|| format!("[-] Invalid count: {}", n))?,
                None => 1,
            };
            Ok(Command::NewJoiners { letter, count })
        }
        ("list", []) | ("ls", []) | ("l", []) => Ok(Command::List),
        ("list", [pod]) | ("ls", [pod]) | ("l", [pod]) => Ok(Command::ListPod(parse_letter(pod)?)),
        ("attach", [id]) | ("a", [id]) => Ok(Command::Attach(canonical_id(id))),
        ("run", rest) | ("r", rest) if !rest.is_empty() => {
            let (letter, cmd_words) = match parse_letter(rest[0]) {
                Ok(letter) if rest.len() > 1 => (Some(letter), &rest[1..]),
                _ => (None, rest),
            };
            if cmd_words.is_empty() {
                return Err("[-] Usage: run [pod] <command>".to_string());
            }
            Ok(Command::Run {
                letter,
                cmd: cmd_words.join(" "),
            })
        }
        ("kill", [pod]) | ("k", [pod]) => Ok(Command::Kill {
            letter: parse_letter(pod)?,
            index: None,
        }),
        ("kill", [pod, index]) | ("k", [pod, index]) => Ok(Command::Kill {
            letter: parse_letter(pod)?,
            index: Some(
                index
                    .parse::<u32>()
                    .map_err(|_| format!("[-] Invalid container index: {}", index))?,
            ),
        }),
        ("forward", [target, port]) | ("f", [target, port]) => Ok(Command::Forward {
            target: target.to_string(),
            port: port
                .parse::<u16>()
                .map_err(|_| format!("[-] Invalid port: {}", port))?,
        }),
        ("clear", []) | ("cls", []) | ("c", []) => Ok(Command::Clear),
        ("help", []) | ("h", []) => Ok(Command::Help),
        ("exit", []) | ("bye", []) => Ok(Command::Exit),
        _ => Err(format!("[-] Unknown command: {}", input)),
    }
}

/// Runs a command inside a container's namespaces through nsenter, keyed
/// by the workload pid, and frames its output.
pub fn exec_in_container(id: &str, pid: Pid, cmd: &str) -> String {
    let output = ProcessCommand::new("nsenter")
        .arg("-t")
        .arg(pid.as_raw().to_string())
        .args(&["-m", "-u", "-i", "-n", "-p", "sh", "-c"])
        .arg(cmd)
        .output();

    let title = format!("EXEC: {} (PID: {})", id, pid.as_raw());
    let lines: Vec<String> = match output {
        Ok(out) => {
            let mut combined = Vec::new();
            combined.extend_from_slice(&out.stdout);
            combined.extend_from_slice(&out.stderr);
            String::from_utf8_lossy(&combined)
                .lines()
                .map(|l| l.trim().to_string())
                .filter(|l| !l.is_empty())
                .collect()
        }
        Err(e) => vec![format!("nsenter failed: {}", e)],
    };

    frame::draw_box(&title, &lines)
}

pub fn help_text() -> String {
    let lines = vec![
        "POD MANAGEMENT".to_string(),
        "  new              Create a new Pod (NetRoot)".to_string(),
        "  new <pod> <n>    Join <n> containers to Pod (default 1)".to_string(),
        "  run [pod] <cmd>  Run a batch command in a new or existing Pod".to_string(),
        "  kill <pod> [n]   SIGKILL a whole Pod or one member".to_string(),
        "  list             List all active Pods".to_string(),
        "  list <pod>       List details for a specific Pod".to_string(),
        "INTERACTION".to_string(),
        "  attach <id>      Connect TTY to container (e.g. attach a1)".to_string(),
        "  detach           Exit current container TTY (Ctrl+X)".to_string(),
        "  forward <id> <p> Forward host port <p> into the Pod".to_string(),
        "EXECUTION".to_string(),
        "  :<id> <cmd>      Run command in one container (e.g. :a1 id)".to_string(),
        "  :* <cmd>         Broadcast command to ALL containers".to_string(),
        "  :!<id> <cmd>     Broadcast to all EXCEPT <id>".to_string(),
        "SYSTEM".to_string(),
        "  clear            Clear the screen".to_string(),
        "  help             Show this menu".to_string(),
        "  exit             Shutdown all pods and exit".to_string(),
    ];
    frame::draw_box("BCTOR COMMAND REFERENCE", &lines)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_new() {
        assert_eq!(parse("new").unwrap(), Command::NewPod);
        assert_eq!(parse("n").unwrap(), Command::NewPod);
        assert_eq!(
            parse("new a").unwrap(),
            Command::NewJoiners {
                letter: 'a',
                count: 1
            }
        );
        assert_eq!(
            parse("n a 3").unwrap(),
            Command::NewJoiners {
                letter: 'a',
                count: 3
            }
        );
        assert!(parse("new a 0").is_err());
        assert!(parse("new abc").is_err());
    }

    #[test]
    fn test_parse_list() {
        assert_eq!(parse("list").unwrap(), Command::List);
        assert_eq!(parse("ls").unwrap(), Command::List);
        assert_eq!(parse("l").unwrap(), Command::List);
        assert_eq!(parse("list b").unwrap(), Command::ListPod('b'));
    }

    #[test]
    fn test_parse_attach_canonicalizes() {
        assert_eq!(
            parse("attach a1").unwrap(),
            Command::Attach("bctor-a1".to_string())
        );
        assert_eq!(
            parse("a bctor-a2").unwrap(),
            Command::Attach("bctor-a2".to_string())
        );
    }

    #[test]
    fn test_parse_exec_forms() {
        assert_eq!(
            parse(":a1 ip addr show").unwrap(),
            Command::ExecOne {
                id: "bctor-a1".to_string(),
                cmd: "ip addr show".to_string()
            }
        );
        assert_eq!(
            parse(":* id").unwrap(),
            Command::ExecAll {
                cmd: "id".to_string()
            }
        );
        assert_eq!(
            parse(":!a1 id").unwrap(),
            Command::ExecExcept {
                id: "bctor-a1".to_string(),
                cmd: "id".to_string()
            }
        );
        assert!(parse(":a1").is_err());
        assert!(parse(": id").is_err());
    }

    #[test]
    fn test_parse_run() {
        assert_eq!(
            parse("run echo hi").unwrap(),
            Command::Run {
                letter: None,
                cmd: "echo hi".to_string()
            }
        );
        assert_eq!(
            parse("run a echo hi").unwrap(),
            Command::Run {
                letter: Some('a'),
                cmd: "echo hi".to_string()
            }
        );
        // a single-word command that happens to be one letter starts a new
        // pod running that command
        assert_eq!(
            parse("r w").unwrap(),
            Command::Run {
                letter: None,
                cmd: "w".to_string()
            }
        );
    }

    #[test]
    fn test_parse_kill_and_forward() {
        assert_eq!(
            parse("kill a").unwrap(),
            Command::Kill {
                letter: 'a',
                index: None
            }
        );
        assert_eq!(
            parse("k a 2").unwrap(),
            Command::Kill {
                letter: 'a',
                index: Some(2)
            }
        );
        assert_eq!(
            parse("forward a 8080").unwrap(),
            Command::Forward {
                target: "a".to_string(),
                port: 8080
            }
        );
        assert!(parse("forward a eighty").is_err());
    }

    #[test]
    fn test_parse_system_commands() {
        for alias in ["clear", "cls", "c"].iter() {
            assert_eq!(parse(alias).unwrap(), Command::Clear);
        }
        for alias in ["help", "h"].iter() {
            assert_eq!(parse(alias).unwrap(), Command::Help);
        }
        for alias in ["exit", "bye"].iter() {
            assert_eq!(parse(alias).unwrap(), Command::Exit);
        }
        assert!(parse("frobnicate").is_err());
    }
}
