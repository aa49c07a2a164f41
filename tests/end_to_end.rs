//! End-to-end scenarios driving a real [`Scheduler`] against real [`Agent`]s
//! over loopback TCP, with a [`MockRemoteExec`] standing in for SSH/SCP and
//! for the worker binary itself (so these exercise the orchestration layer —
//! phase ordering, handshakes, status polling, kill-all — not the map/reduce
//! binary's own behavior, which is out of scope for this core).
//!
//! The shuffle-colocation scenario isn't repeated here: it's already
//! exercised directly, and more precisely, by the unit tests in
//! `src/agent/shuffle.rs`.

use std::net::{SocketAddr, TcpListener};
use std::thread;
use std::time::{Duration, Instant};

use mrlite::agent::Agent;
use mrlite::config::GlobalConfig;
use mrlite::error::AgentError;
use mrlite::remote_exec::MockRemoteExec;
use mrlite::scheduler::Scheduler;
use mrlite::task::{Format, Task, TaskList};

const IDENTITY: &str = "wc-itest-2024-01-01-00-00";
const TICK: Duration = Duration::from_millis(20);

fn free_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

/// The scheduler thread binds the listener asynchronously, so agent threads
/// retry their connect for a short window instead of racing it.
fn handshake_with_retry<'a>(addr: SocketAddr, rank: usize, exec: &'a MockRemoteExec) -> Agent<'a, MockRemoteExec> {
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        match Agent::handshake(addr, rank, exec) {
            Ok(agent) => return agent,
            Err(_) if Instant::now() < deadline => thread::sleep(Duration::from_millis(5)),
            Err(e) => panic!("rank {rank} never handshook: {e}"),
        }
    }
}

fn seed_shuffle_buffer(dir: &std::path::Path, mapper_rank: usize, reducer_local_id: usize, seq: usize) {
    let name = format!(
        "{IDENTITY}-mapper-{:05}-reducer-{:05}-{:08}",
        mapper_rank, reducer_local_id, seq
    );
    std::fs::write(dir.join(name), b"partition").unwrap();
}

fn task(host: &str, class: &str, input_format: Option<Format>, input_path: String, output_format: Option<Format>, output_path: String, scratch: &std::path::Path) -> Task {
    Task {
        host: host.to_string(),
        user_class: class.to_string(),
        input_format,
        input_path,
        output_format,
        output_path,
        tmp_dir: scratch.to_string_lossy().into_owned(),
        log_filebase: scratch.join("log").to_string_lossy().into_owned(),
    }
}

/// Runs a job to completion against a fresh [`MockRemoteExec`], returning the
/// scheduler's own result plus each agent's.
fn run_job(config: GlobalConfig, exit_code: i32) -> (Result<(), mrlite::error::SchedulerError>, Vec<Result<(), AgentError>>) {
    let mut exec = MockRemoteExec::default();
    exec.exit_code = exit_code;
    let n = config.num_worker();
    let addr = free_addr();
    let mut scheduler = Scheduler::new(config, &exec);
    let exec_ref = &exec;

    thread::scope(|scope| {
        let sched_handle = scope.spawn(move || {
            scheduler.connect(addr)?;
            scheduler.start_jobs()?;
            let monitor_result = scheduler.monitor_jobs(TICK);
            if monitor_result.is_ok() {
                scheduler.quit_jobs();
            } else {
                scheduler.kill_jobs();
            }
            monitor_result
        });

        let agent_handles: Vec<_> = (0..n)
            .map(|rank| {
                scope.spawn(move || {
                    let mut agent = handshake_with_retry(addr, rank, exec_ref);
                    agent.check_options()?;
                    agent.run()
                })
            })
            .collect();

        let sched_result = sched_handle.join().expect("scheduler thread panicked");
        let agent_results = agent_handles
            .into_iter()
            .map(|h| h.join().expect("agent thread panicked"))
            .collect();
        (sched_result, agent_results)
    })
}

fn base_config(tasks: Vec<Task>, num_map_worker: usize, num_reduce_worker: usize, map_only: bool, incremental: bool) -> GlobalConfig {
    GlobalConfig {
        job_identity: IDENTITY.to_string(),
        tasks: TaskList {
            tasks,
            num_map_worker,
            num_reduce_worker,
            map_only,
        },
        incremental,
        force_mkdir: false,
        buffer_size: 1024,
        reduce_endpoints: vec!["127.0.0.1:9100".parse().unwrap(); num_reduce_worker],
        ssh_port: 22,
        worker_cmd: vec![],
    }
}

#[test]
fn batch_two_mappers_one_reducer_happy_path() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();

    let m0_in = root.join("m0_in");
    let m1_in = root.join("m1_in");
    let out = root.join("out");
    let r_in = root.join("r_in");
    let final_dir = root.join("final");
    for d in [&m0_in, &m1_in, &out, &r_in, &final_dir] {
        std::fs::create_dir_all(d).unwrap();
    }
    std::fs::write(m0_in.join("part-00000"), b"a b c").unwrap();
    std::fs::write(m1_in.join("part-00000"), b"d e f").unwrap();
    seed_shuffle_buffer(&r_in, 0, 0, 0);
    seed_shuffle_buffer(&r_in, 1, 0, 1);

    let tasks = vec![
        task("127.0.0.1", "M0", Some(Format::Text), format!("{}/part-*", m0_in.display()), None, out.display().to_string(), root),
        task("127.0.0.1", "M1", Some(Format::Text), format!("{}/part-*", m1_in.display()), None, out.display().to_string(), root),
        task("127.0.0.1", "R0", None, r_in.display().to_string(), Some(Format::Text), format!("{}/out", final_dir.display()), root),
    ];
    let config = base_config(tasks, 2, 1, false, false);

    let (sched_result, agent_results) = run_job(config, 0);
    sched_result.expect("batch happy path should succeed");
    for (rank, r) in agent_results.into_iter().enumerate() {
        r.unwrap_or_else(|e| panic!("rank {rank} agent failed: {e}"));
    }
}

#[test]
fn incremental_one_by_one_happy_path() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();

    let m_in = root.join("m_in");
    let out = root.join("out");
    let r_in = root.join("r_in");
    let final_dir = root.join("final");
    for d in [&m_in, &out, &r_in, &final_dir] {
        std::fs::create_dir_all(d).unwrap();
    }
    std::fs::write(m_in.join("part-00000"), b"a b c").unwrap();

    let tasks = vec![
        task("127.0.0.1", "M0", Some(Format::Text), format!("{}/part-*", m_in.display()), None, out.display().to_string(), root),
        task("127.0.0.1", "R0", None, r_in.display().to_string(), Some(Format::Text), format!("{}/out", final_dir.display()), root),
    ];
    let config = base_config(tasks, 1, 1, false, true);

    let (sched_result, agent_results) = run_job(config, 0);
    sched_result.expect("incremental happy path should succeed");
    for (rank, r) in agent_results.into_iter().enumerate() {
        r.unwrap_or_else(|e| panic!("rank {rank} agent failed: {e}"));
    }
}

#[test]
fn map_only_three_hosts_runs_without_reducers() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();

    let mut tasks = Vec::new();
    for i in 0..3 {
        let in_dir = root.join(format!("m{i}_in"));
        let out_dir = root.join(format!("m{i}_out"));
        std::fs::create_dir_all(&in_dir).unwrap();
        std::fs::create_dir_all(&out_dir).unwrap();
        std::fs::write(in_dir.join("part-00000"), b"data").unwrap();
        tasks.push(task(
            "127.0.0.1",
            &format!("M{i}"),
            Some(Format::Text),
            format!("{}/part-*", in_dir.display()),
            Some(Format::Text),
            out_dir.display().to_string(),
            root,
        ));
    }
    let config = base_config(tasks, 3, 0, true, false);
    assert!(config.reduce_endpoints.is_empty());

    let (sched_result, agent_results) = run_job(config, 0);
    sched_result.expect("map-only job should succeed");
    for (rank, r) in agent_results.into_iter().enumerate() {
        r.unwrap_or_else(|e| panic!("rank {rank} agent failed: {e}"));
    }
}

#[test]
fn mapper_failure_triggers_kill_all() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();

    let m_in = root.join("m_in");
    let out = root.join("out");
    let r_in = root.join("r_in");
    let final_dir = root.join("final");
    for d in [&m_in, &out, &r_in, &final_dir] {
        std::fs::create_dir_all(d).unwrap();
    }
    std::fs::write(m_in.join("part-00000"), b"a b c").unwrap();
    seed_shuffle_buffer(&r_in, 0, 0, 0);

    let tasks = vec![
        task("127.0.0.1", "M0", Some(Format::Text), format!("{}/part-*", m_in.display()), None, out.display().to_string(), root),
        task("127.0.0.1", "R0", None, r_in.display().to_string(), Some(Format::Text), format!("{}/out", final_dir.display()), root),
    ];
    let config = base_config(tasks, 1, 1, false, false);

    let (sched_result, _agent_results) = run_job(config, 1);
    let err = sched_result.expect_err("a nonzero worker exit should abort the job");
    assert!(matches!(
        err,
        mrlite::error::SchedulerError::WorkerFailed { rank: 0, .. }
    ));
}

#[test]
fn batch_reducer_with_no_shuffle_input_aborts_the_job() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();

    let m_in = root.join("m_in");
    let out = root.join("out");
    let r_in = root.join("r_in");
    let final_dir = root.join("final");
    for d in [&m_in, &out, &r_in, &final_dir] {
        std::fs::create_dir_all(d).unwrap();
    }
    std::fs::write(m_in.join("part-00000"), b"a b c").unwrap();
    // r_in deliberately left empty: no shuffle buffer ever lands there.

    let tasks = vec![
        task("127.0.0.1", "M0", Some(Format::Text), format!("{}/part-*", m_in.display()), None, out.display().to_string(), root),
        task("127.0.0.1", "R0", None, r_in.display().to_string(), Some(Format::Text), format!("{}/out", final_dir.display()), root),
    ];
    let config = base_config(tasks, 1, 1, false, false);

    let (sched_result, agent_results) = run_job(config, 0);
    assert!(
        sched_result.is_err(),
        "a reducer with zero shuffle buffers should abort the job, not succeed silently"
    );
    assert!(matches!(
        agent_results[1],
        Err(AgentError::EmptyReduceBuffers(_))
    ));
}
