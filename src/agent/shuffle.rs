//! The Shuffle Mover (§5 step 5): routes per-reducer partition files produced
//! by a mapper to their destination reducer, and the reducer-side pass that
//! renames scattered buffers into a dense sequence before reduction starts.
//!
//! Buffer files are named
//! `<identity>-mapper-<mapper_id>-reducer-<reducer_id>-<seq>`, both ids
//! zero-padded to 5 digits.

use std::path::Path;

use glob::glob;
use log::debug;

use crate::config::GlobalConfig;
use crate::error::AgentError;
use crate::remote_exec::RemoteExec;
use crate::task::Rank;

/// Moves every shuffle buffer a mapper produced to its destination reducer:
/// a local `mv` when mapper and reducer share a host and directory differ, a
/// remote copy-then-delete otherwise. A directory-identical colocation is
/// left untouched (the file already sits where the reducer will read it
/// from).
pub fn push_reduce_buffers(
    config: &GlobalConfig,
    mapper_rank: Rank,
    exec: &dyn RemoteExec,
) -> Result<(), AgentError> {
    let mapper_task = config.tasks.task(mapper_rank);
    let mapper_id = format!("{:05}", mapper_rank);
    let pattern = format!(
        "{}/{}-mapper-{}-reducer-*",
        mapper_task.output_path, config.job_identity, mapper_id
    );

    for entry in glob(&pattern).map_err(|e| AgentError::Io(std::io::Error::other(e)))? {
        let path = entry.map_err(|e| AgentError::Io(std::io::Error::other(e)))?;
        let filename = path.to_string_lossy().into_owned();
        let basename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let parts: Vec<&str> = basename.rsplitn(5, '-').collect();
        if parts.len() != 5 {
            continue;
        }
        let reducer_id_field = parts[1];
        let mapper_id_field = parts[3];
        debug_assert_eq!(mapper_id_field, mapper_id);

        let local_reducer_id: usize = reducer_id_field
            .parse()
            .map_err(|_| AgentError::Io(std::io::Error::other("malformed reducer id in buffer filename")))?;
        let reducer_rank = local_reducer_id + config.tasks.num_map_worker;
        let reducer_task = config.tasks.task(reducer_rank);

        debug!(
            "push reduce buffer {filename} from {} to {}",
            mapper_task.host, reducer_task.host
        );

        if reducer_task.host == mapper_task.host {
            if reducer_task.input_path != mapper_task.output_path {
                let cmd = format!("mv {} {}", filename, reducer_task.input_path);
                exec.run_local(&cmd)
                    .map_err(AgentError::RemoteExec)?
                    .wait()
                    .map_err(AgentError::RemoteExec)?;
            }
        } else {
            exec.copy_files(&reducer_task.host, &[Path::new(&filename)], &reducer_task.input_path)
                .map_err(AgentError::RemoteExec)?;
            std::fs::remove_file(&path)?;
        }
    }
    Ok(())
}

/// Renames every buffer destined for `reducer_rank` from its mapper-tagged
/// name to `<prefix>-<dense-seq>`, returning the count found. Zero matches is
/// fatal: a reducer with no input would silently produce empty output.
pub fn prepare_reduce_buffers(
    config: &GlobalConfig,
    reducer_rank: Rank,
    exec: &dyn RemoteExec,
) -> Result<usize, AgentError> {
    let task = config.tasks.task(reducer_rank);
    let local_reducer_id = config.tasks.local_rank(reducer_rank);
    let reducer_id = format!("{:05}", local_reducer_id);
    let pattern = format!(
        "{}/{}-mapper-*-reducer-{}-*",
        task.input_path, config.job_identity, reducer_id
    );

    let mut matches: Vec<_> = glob(&pattern)
        .map_err(|e| AgentError::Io(std::io::Error::other(e)))?
        .filter_map(Result::ok)
        .collect();
    matches.sort();

    if matches.is_empty() {
        return Err(AgentError::EmptyReduceBuffers(pattern));
    }

    let mut num = 0usize;
    for path in &matches {
        let basename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let parts: Vec<&str> = basename.rsplitn(6, '-').collect();
        if parts.len() != 6 {
            continue;
        }
        debug_assert_eq!(parts[1], reducer_id);
        let prefix = parts[5];
        let dir = path.parent().map(|p| p.to_string_lossy().into_owned()).unwrap_or_default();
        let newname = format!("{dir}/{prefix}-{num:010}");
        let cmd = format!("mv {} {}", path.display(), newname);
        exec.run_local(&cmd)
            .map_err(AgentError::RemoteExec)?
            .wait()
            .map_err(AgentError::RemoteExec)?;
        num += 1;
    }
    debug!("renamed {num} buffer files for reducer {reducer_id}");
    Ok(num)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote_exec::MockRemoteExec;
    use crate::task::{Format, Task, TaskList};
    use tempfile::tempdir;

    fn two_host_config(mapper_out: &str, reducer_in: &str) -> GlobalConfig {
        GlobalConfig {
            job_identity: "wc-alice-2024-01-01-00-00".to_string(),
            tasks: TaskList {
                tasks: vec![
                    Task {
                        host: "10.0.0.1".to_string(),
                        user_class: "M".to_string(),
                        input_format: Some(Format::Text),
                        input_path: "/in/*".to_string(),
                        output_format: None,
                        output_path: mapper_out.to_string(),
                        tmp_dir: "/tmp/mrlite".to_string(),
                        log_filebase: "/tmp/mrlite/log".to_string(),
                    },
                    Task {
                        host: "10.0.0.2".to_string(),
                        user_class: "R".to_string(),
                        input_format: None,
                        input_path: reducer_in.to_string(),
                        output_format: Some(Format::Text),
                        output_path: "/final".to_string(),
                        tmp_dir: "/tmp/mrlite".to_string(),
                        log_filebase: "/tmp/mrlite/log".to_string(),
                    },
                ],
                num_map_worker: 1,
                num_reduce_worker: 1,
                map_only: false,
            },
            incremental: false,
            force_mkdir: false,
            buffer_size: 1024,
            reduce_endpoints: vec![],
            ssh_port: 22,
            worker_cmd: vec![],
        }
    }

    #[test]
    fn push_copies_cross_host_buffer_and_removes_local_copy() {
        let dir = tempdir().unwrap();
        let dir_path = dir.path().to_str().unwrap();
        let mut config = two_host_config(dir_path, "/reducer/in");
        config.tasks.tasks[1].host = "10.0.0.2".to_string();

        let fname = format!("{}/{}-mapper-00000-reducer-00000-00000000", dir_path, config.job_identity);
        std::fs::write(&fname, b"partition").unwrap();

        let exec = MockRemoteExec::default();
        push_reduce_buffers(&config, 0, &exec).unwrap();

        assert!(!Path::new(&fname).exists());
        let copies = exec.copies.lock().unwrap();
        assert_eq!(copies.len(), 1);
        assert_eq!(copies[0].0, "10.0.0.2");
        assert_eq!(copies[0].1, "/reducer/in");
    }

    #[test]
    fn push_leaves_colocated_same_directory_buffer_untouched() {
        let dir = tempdir().unwrap();
        let dir_path = dir.path().to_str().unwrap();
        let mut config = two_host_config(dir_path, dir_path);
        config.tasks.tasks[1].host = "10.0.0.1".to_string();

        let fname = format!("{}/{}-mapper-00000-reducer-00000-00000000", dir_path, config.job_identity);
        std::fs::write(&fname, b"partition").unwrap();

        let exec = MockRemoteExec::default();
        push_reduce_buffers(&config, 0, &exec).unwrap();

        assert!(Path::new(&fname).exists());
        assert!(exec.local_calls.lock().unwrap().is_empty());
        assert!(exec.copies.lock().unwrap().is_empty());
    }

    #[test]
    fn prepare_renames_into_dense_sequence() {
        let dir = tempdir().unwrap();
        let dir_path = dir.path().to_str().unwrap();
        let config = two_host_config("/mapper/out", dir_path);
        let identity = &config.job_identity;

        for (mapper_id, seq) in [(0, 3), (1, 0)] {
            let fname = format!(
                "{dir_path}/{identity}-mapper-{:05}-reducer-00000-{:08}",
                mapper_id, seq
            );
            std::fs::write(&fname, b"x").unwrap();
        }

        let exec = MockRemoteExec::default();
        let count = prepare_reduce_buffers(&config, 1, &exec).unwrap();
        assert_eq!(count, 2);
        assert!(Path::new(&format!("{dir_path}/{identity}-0000000000")).exists());
        assert!(Path::new(&format!("{dir_path}/{identity}-0000000001")).exists());
    }

    #[test]
    fn prepare_fails_when_no_buffers_match() {
        let dir = tempdir().unwrap();
        let config = two_host_config("/mapper/out", dir.path().to_str().unwrap());
        let exec = MockRemoteExec::default();
        assert!(matches!(
            prepare_reduce_buffers(&config, 1, &exec),
            Err(AgentError::EmptyReduceBuffers(_))
        ));
    }
}
