//! Service description file parser.
//!
//! Descriptions are flat `key = value` files, one per service. `#` starts a
//! comment; blank lines are ignored; `depends-on`, `waits-for` and `options`
//! may be given multiple times.

use std::path::PathBuf;
use std::time::Duration;

use nix::sys::signal::Signal;

use crate::services::{ServiceConfig, ServiceType};

use super::LoadError;

/// Parse a service description into a config. `name` is the service name
/// (the file name), used for error reporting.
pub fn parse_service(name: &str, content: &str) -> Result<ServiceConfig, LoadError> {
    let mut service_type: Option<ServiceType> = None;
    let mut config = ServiceConfig::new(name, ServiceType::Process);

    for (idx, raw_line) in content.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            return Err(parse_err(name, line_no, "expected 'key = value'"));
        };
        let key = key.trim();
        let value = value.trim();

        match key {
            "type" => {
                service_type = Some(match value {
                    "internal" => ServiceType::Internal,
                    "process" => ServiceType::Process,
                    "bgprocess" => ServiceType::Bgprocess,
                    "scripted" => ServiceType::Scripted,
                    other => {
                        return Err(parse_err(
                            name,
                            line_no,
                            &format!("unknown service type '{}'", other),
                        ))
                    }
                });
            }
            "command" => config.command = split_command(name, line_no, value)?,
            "stop-command" => config.stop_command = split_command(name, line_no, value)?,
            "depends-on" => config.depends_on.push(value.to_string()),
            "waits-for" => config.waits_for.push(value.to_string()),
            "logfile" => config.logfile = Some(PathBuf::from(value)),
            "pid-file" => config.pid_file = Some(PathBuf::from(value)),
            "restart" => config.auto_restart = parse_bool(name, line_no, value)?,
            "smooth-recovery" => config.smooth_recovery = parse_bool(name, line_no, value)?,
            "options" => {
                for opt in value.split_whitespace() {
                    match opt {
                        "runs-on-console" => config.flags.runs_on_console = true,
                        "starts-on-console" => config.flags.starts_on_console = true,
                        "no-sigterm" => config.flags.no_sigterm = true,
                        "pass-cs-fd" => config.flags.pass_cs_fd = true,
                        other => {
                            return Err(parse_err(
                                name,
                                line_no,
                                &format!("unknown option '{}'", other),
                            ))
                        }
                    }
                }
            }
            "socket-listen" => config.socket_path = Some(PathBuf::from(value)),
            "socket-permissions" => {
                config.socket_perms = u32::from_str_radix(value, 8).map_err(|_| {
                    parse_err(name, line_no, "socket-permissions must be octal")
                })?;
            }
            "socket-uid" => {
                config.socket_uid = Some(value.parse().map_err(|_| {
                    parse_err(name, line_no, "socket-uid must be a numeric user id")
                })?);
            }
            "socket-gid" => {
                config.socket_gid = Some(value.parse().map_err(|_| {
                    parse_err(name, line_no, "socket-gid must be a numeric group id")
                })?);
            }
            "term-signal" => config.term_signal = Some(parse_signal(name, line_no, value)?),
            "restart-delay" => config.restart_delay = parse_duration(name, line_no, value)?,
            "restart-limit-interval" => {
                config.restart_interval = parse_duration(name, line_no, value)?;
            }
            "restart-limit-count" => {
                config.max_restart_count = value.parse().map_err(|_| {
                    parse_err(name, line_no, "restart-limit-count must be a number")
                })?;
            }
            other => {
                return Err(parse_err(
                    name,
                    line_no,
                    &format!("unknown setting '{}'", other),
                ));
            }
        }
    }

    let Some(service_type) = service_type else {
        return Err(LoadError::Invalid {
            name: name.to_string(),
            reason: "no service type specified".to_string(),
        });
    };
    config.service_type = service_type;

    // Per-type sanity.
    match service_type {
        ServiceType::Internal => {
            if !config.command.is_empty() {
                return Err(LoadError::Invalid {
                    name: name.to_string(),
                    reason: "internal services have no command".to_string(),
                });
            }
        }
        ServiceType::Bgprocess => {
            if config.command.is_empty() {
                return Err(missing(name, "command"));
            }
            if config.pid_file.is_none() {
                return Err(missing(name, "pid-file"));
            }
        }
        ServiceType::Process | ServiceType::Scripted => {
            if config.command.is_empty() {
                return Err(missing(name, "command"));
            }
        }
    }

    Ok(config)
}

fn parse_err(name: &str, line: usize, reason: &str) -> LoadError {
    LoadError::Parse {
        name: name.to_string(),
        line,
        reason: reason.to_string(),
    }
}

fn missing(name: &str, setting: &str) -> LoadError {
    LoadError::Invalid {
        name: name.to_string(),
        reason: format!("missing required setting '{}'", setting),
    }
}

fn split_command(name: &str, line: usize, value: &str) -> Result<Vec<String>, LoadError> {
    let args =
        shlex::split(value).ok_or_else(|| parse_err(name, line, "bad quoting in command"))?;
    if args.is_empty() {
        return Err(parse_err(name, line, "empty command"));
    }
    Ok(args)
}

fn parse_bool(name: &str, line: usize, value: &str) -> Result<bool, LoadError> {
    match value {
        "yes" | "true" => Ok(true),
        "no" | "false" => Ok(false),
        _ => Err(parse_err(name, line, "expected yes/no")),
    }
}

fn parse_duration(name: &str, line: usize, value: &str) -> Result<Duration, LoadError> {
    let secs: f64 = value
        .parse()
        .map_err(|_| parse_err(name, line, "expected a duration in seconds"))?;
    if !secs.is_finite() || secs < 0.0 {
        return Err(parse_err(name, line, "expected a non-negative duration"));
    }
    Ok(Duration::from_secs_f64(secs))
}

fn parse_signal(name: &str, line: usize, value: &str) -> Result<Signal, LoadError> {
    match value {
        "HUP" | "SIGHUP" => Ok(Signal::SIGHUP),
        "INT" | "SIGINT" => Ok(Signal::SIGINT),
        "QUIT" | "SIGQUIT" => Ok(Signal::SIGQUIT),
        "KILL" | "SIGKILL" => Ok(Signal::SIGKILL),
        "USR1" | "SIGUSR1" => Ok(Signal::SIGUSR1),
        "USR2" | "SIGUSR2" => Ok(Signal::SIGUSR2),
        "TERM" | "SIGTERM" => Ok(Signal::SIGTERM),
        _ => Err(parse_err(name, line, "unrecognized signal name")),
    }
}
