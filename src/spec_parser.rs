//! Task Specification Parser (§4.1): turns `--map-io`/`--reduce-io`/
//! `--maponly-map-io` plus the tmp-dir and log-filebase specs into a
//! normalized, ranked [`TaskList`].

use std::collections::HashMap;
use std::net::{TcpListener, ToSocketAddrs};
use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::SpecError;
use crate::task::{Format, Task, TaskList};

/// `{hosts}path`, the shared shape of tmp-dir and log-filebase entries.
static HOST_PATH_ENTRY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\{(?P<hosts>[^}]+)\}(?P<path>[^;]+)$").unwrap());

/// Splits on `sep`, trims whitespace around each field, and drops empty
/// entries, mirroring the original `split_fields` helper exactly.
fn split_fields(s: &str, sep: char) -> Vec<String> {
    s.split(sep)
        .map(|f| f.trim().to_string())
        .filter(|f| !f.is_empty())
        .collect()
}

/// Four dotted-decimal components, each `< 256`, no leading zero unless the
/// component is the literal `"0"`. This quirk (`"010"` rejected, `"0"`
/// accepted) is intentionally preserved from the original parser.
fn is_ipv4_literal(s: &str) -> bool {
    let parts: Vec<&str> = s.split('.').collect();
    if parts.len() != 4 {
        return false;
    }
    parts.iter().all(|p| {
        !p.is_empty()
            && p.chars().all(|c| c.is_ascii_digit())
            && (p.len() == 1 || !p.starts_with('0'))
            && p.parse::<u16>().map(|v| v < 256).unwrap_or(false)
    })
}

/// Resolves a hostname or IPv4 literal to a dotted-decimal IPv4 string.
/// IPv4 literals pass through unchanged; everything else goes through the
/// system name service once.
pub fn resolve_host(host: &str) -> Result<String, SpecError> {
    if is_ipv4_literal(host) {
        return Ok(host.to_string());
    }
    let addrs = (host, 0u16)
        .to_socket_addrs()
        .map_err(|source| SpecError::HostResolution {
            host: host.to_string(),
            source,
        })?;
    addrs
        .filter_map(|a| match a.ip() {
            std::net::IpAddr::V4(v4) => Some(v4.to_string()),
            std::net::IpAddr::V6(_) => None,
        })
        .next()
        .ok_or_else(|| SpecError::HostResolution {
            host: host.to_string(),
            source: std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "no IPv4 address for host",
            ),
        })
}

/// Probes `n` free ports by binding ephemeral listeners on the local loopback
/// interface and immediately closing them. The port number is reused for the
/// reducer's public endpoint even though the bind happened on the scheduler
/// host, not the reducer's. A race in principle, but one the reference
/// launcher accepts too.
pub fn allocate_ephemeral_ports(n: usize) -> std::io::Result<Vec<u16>> {
    let listeners: Vec<TcpListener> = (0..n)
        .map(|_| TcpListener::bind(("127.0.0.1", 0)))
        .collect::<std::io::Result<_>>()?;
    listeners.iter().map(|l| l.local_addr().map(|a| a.port())).collect()
}

/// Parses a `{hosts}path(;{hosts}path)*` spec into a resolved-host→path map,
/// used for both the tmp-dir and log-filebase options.
pub fn parse_host_path_map(spec: &str) -> Result<HashMap<String, String>, SpecError> {
    let mut result = HashMap::new();
    for entry in split_fields(spec, ';') {
        let caps = HOST_PATH_ENTRY
            .captures(&entry)
            .ok_or_else(|| SpecError::MalformedEntry(entry.clone()))?;
        let hosts = &caps["hosts"];
        let path = normalize_path(caps["path"].trim());
        for host in split_fields(hosts, ',') {
            let ip = resolve_host(&host)?;
            result.insert(ip, path.clone());
        }
    }
    Ok(result)
}

fn normalize_path(p: &str) -> String {
    let trimmed = p.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Strips the surrounding `{` `}` and splits the host list by comma.
fn parse_hosts_field(field: &str) -> Result<Vec<String>, SpecError> {
    let field = field.trim();
    if !field.starts_with('{') || !field.ends_with('}') {
        return Err(SpecError::MalformedEntry(field.to_string()));
    }
    let inner = &field[1..field.len() - 1];
    let hosts = split_fields(inner, ',');
    if hosts.is_empty() {
        return Err(SpecError::MalformedEntry(field.to_string()));
    }
    Ok(hosts)
}

fn parse_format(s: &str) -> Result<Format, SpecError> {
    Format::parse(s).ok_or_else(|| SpecError::UnknownFormat(s.to_string()))
}

fn lookup_host_maps(
    host: &str,
    tmp_dir_map: &HashMap<String, String>,
    log_filebase_map: &HashMap<String, String>,
) -> Result<(String, String), SpecError> {
    let tmp_dir = tmp_dir_map
        .get(host)
        .ok_or_else(|| SpecError::MissingTmpDir(host.to_string()))?
        .clone();
    let log_filebase = log_filebase_map
        .get(host)
        .ok_or_else(|| SpecError::MissingLogFilebase(host.to_string()))?
        .clone();
    Ok((tmp_dir, log_filebase))
}

/// Parses `--map-io`: `{hosts}:class:input_format:input_path:output_path` per
/// entry, fanning each `{h1,h2,...}` out to one task per host.
fn parse_map_entries(
    spec: &str,
    tmp_dir_map: &HashMap<String, String>,
    log_filebase_map: &HashMap<String, String>,
) -> Result<Vec<Task>, SpecError> {
    let mut tasks = Vec::new();
    for entry in split_fields(spec, ';') {
        let fields = split_fields(&entry, ':');
        if fields.len() != 5 {
            return Err(SpecError::WrongFieldCount {
                entry: entry.clone(),
                found: fields.len(),
                expected: 5,
            });
        }
        let hosts = parse_hosts_field(&fields[0])?;
        let class = fields[1].clone();
        let input_format = parse_format(&fields[2])?;
        let input_path = fields[3].clone();
        let output_path = fields[4].clone();
        for host in hosts {
            let ip = resolve_host(&host)?;
            let (tmp_dir, log_filebase) = lookup_host_maps(&ip, tmp_dir_map, log_filebase_map)?;
            tasks.push(Task {
                host: ip,
                user_class: class.clone(),
                input_format: Some(input_format),
                input_path: input_path.clone(),
                output_format: None,
                output_path: output_path.clone(),
                tmp_dir,
                log_filebase,
            });
        }
    }
    Ok(tasks)
}

/// Parses `--maponly-map-io`:
/// `{hosts}:class:input_format:input_path:output_format:output_path`.
fn parse_maponly_entries(
    spec: &str,
    tmp_dir_map: &HashMap<String, String>,
    log_filebase_map: &HashMap<String, String>,
) -> Result<Vec<Task>, SpecError> {
    let mut tasks = Vec::new();
    for entry in split_fields(spec, ';') {
        let fields = split_fields(&entry, ':');
        if fields.len() != 6 {
            return Err(SpecError::WrongFieldCount {
                entry: entry.clone(),
                found: fields.len(),
                expected: 6,
            });
        }
        let hosts = parse_hosts_field(&fields[0])?;
        let class = fields[1].clone();
        let input_format = parse_format(&fields[2])?;
        let input_path = fields[3].clone();
        let output_format = parse_format(&fields[4])?;
        let output_path = fields[5].clone();
        for host in hosts {
            let ip = resolve_host(&host)?;
            let (tmp_dir, log_filebase) = lookup_host_maps(&ip, tmp_dir_map, log_filebase_map)?;
            tasks.push(Task {
                host: ip,
                user_class: class.clone(),
                input_format: Some(input_format),
                input_path: input_path.clone(),
                output_format: Some(output_format),
                output_path: output_path.clone(),
                tmp_dir,
                log_filebase,
            });
        }
    }
    Ok(tasks)
}

/// Parses `--reduce-io`: `{hosts}:class:input_path:output_format:output_path`.
fn parse_reduce_entries(
    spec: &str,
    tmp_dir_map: &HashMap<String, String>,
    log_filebase_map: &HashMap<String, String>,
) -> Result<Vec<Task>, SpecError> {
    let mut tasks = Vec::new();
    for entry in split_fields(spec, ';') {
        let fields = split_fields(&entry, ':');
        if fields.len() != 5 {
            return Err(SpecError::WrongFieldCount {
                entry: entry.clone(),
                found: fields.len(),
                expected: 5,
            });
        }
        let hosts = parse_hosts_field(&fields[0])?;
        let class = fields[1].clone();
        let input_path = fields[2].clone();
        let output_format = parse_format(&fields[3])?;
        let output_path = fields[4].clone();
        for host in hosts {
            let ip = resolve_host(&host)?;
            let (tmp_dir, log_filebase) = lookup_host_maps(&ip, tmp_dir_map, log_filebase_map)?;
            tasks.push(Task {
                host: ip,
                user_class: class.clone(),
                input_format: None,
                input_path: input_path.clone(),
                output_format: Some(output_format),
                output_path: output_path.clone(),
                tmp_dir,
                log_filebase,
            });
        }
    }
    Ok(tasks)
}

/// All inputs needed to build a [`TaskList`]. Exactly one of `{map_io and
/// reduce_io}` / `maponly_map_io` must be populated.
pub struct TaskSpecInput<'a> {
    pub map_io: Option<&'a str>,
    pub reduce_io: Option<&'a str>,
    pub maponly_map_io: Option<&'a str>,
    pub tmp_dir_spec: &'a str,
    pub log_filebase_spec: &'a str,
    pub local_executable: &'a Path,
}

pub fn parse_task_spec(input: TaskSpecInput) -> Result<TaskList, SpecError> {
    if !input.local_executable.exists() {
        return Err(SpecError::MissingLocalExecutable(
            input.local_executable.to_path_buf(),
        ));
    }

    let tmp_dir_map = parse_host_path_map(input.tmp_dir_spec)?;
    let log_filebase_map = parse_host_path_map(input.log_filebase_spec)?;

    if let Some(maponly) = input.maponly_map_io {
        if input.map_io.is_some() || input.reduce_io.is_some() {
            return Err(SpecError::MapOnlyConflict);
        }
        let tasks = parse_maponly_entries(maponly, &tmp_dir_map, &log_filebase_map)?;
        let num_map_worker = tasks.len();
        return Ok(TaskList {
            tasks,
            num_map_worker,
            num_reduce_worker: 0,
            map_only: true,
        });
    }

    let (map_io, reduce_io) = match (input.map_io, input.reduce_io) {
        (Some(m), Some(r)) => (m, r),
        _ => return Err(SpecError::TwoPhaseIncomplete),
    };

    let map_tasks = parse_map_entries(map_io, &tmp_dir_map, &log_filebase_map)?;
    let reduce_tasks = parse_reduce_entries(reduce_io, &tmp_dir_map, &log_filebase_map)?;
    let num_map_worker = map_tasks.len();
    let num_reduce_worker = reduce_tasks.len();

    let mut tasks = map_tasks;
    tasks.extend(reduce_tasks);

    Ok(TaskList {
        tasks,
        num_map_worker,
        num_reduce_worker,
        map_only: false,
    })
}
