//! Builds the worker binary's argv for each role (§6), mirroring the
//! `--mr_*` flag set the reference `get_worker_cmd` methods produce.

use crate::config::GlobalConfig;
use crate::task::Rank;

fn reduce_workers_list(config: &GlobalConfig) -> String {
    config
        .reduce_endpoints
        .iter()
        .map(|a| a.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

fn executable_invocation(config: &GlobalConfig, rank: Rank) -> String {
    let task = config.tasks.task(rank);
    let tail = config.worker_cmd.join(" ");
    if tail.is_empty() {
        format!("{}/{}", task.tmp_dir, config.job_identity)
    } else {
        format!("{}/{} {}", task.tmp_dir, config.job_identity, tail)
    }
}

/// Two-phase mapper: writes per-reducer shuffle buffers under `output_path`.
pub fn map_worker_cmd(config: &GlobalConfig, rank: Rank) -> String {
    let task = config.tasks.task(rank);
    let reduce_input_buffer_size = config.buffer_size / config.tasks.num_reduce_worker.max(1);
    format!(
        concat!(
            "{exe}",
            " --mr_input_filepattern=\"{input}\"",
            " --mr_reduce_input_filebase=\"{out}/{identity}\"",
            " --mr_batch_reduction={batch}",
            " --mr_log_filebase=\"{log}\"",
            " --mr_num_map_workers={num_map}",
            " --mr_reduce_input_buffer_size={buf}",
            " --mr_reduce_workers={reducers}",
            " --mr_map_worker_id={id}",
            " --mr_map_only=false",
            " --mr_mapper_class={class}",
            " --mr_input_format={input_format}",
        ),
        exe = executable_invocation(config, rank),
        input = task.input_path,
        out = task.output_path,
        identity = config.job_identity,
        batch = !config.incremental,
        log = task.log_filebase,
        num_map = config.tasks.num_map_worker,
        buf = reduce_input_buffer_size,
        reducers = reduce_workers_list(config),
        id = rank,
        class = task.user_class,
        input_format = task.input_format.expect("mapper task has an input format"),
    )
}

/// Map-only mapper: writes its final output directly, no shuffle buffers.
pub fn maponly_worker_cmd(config: &GlobalConfig, rank: Rank) -> String {
    let task = config.tasks.task(rank);
    format!(
        concat!(
            "{exe}",
            " --mr_input_filepattern=\"{input}\"",
            " --mr_output_files=\"{out}\"",
            " --mr_log_filebase=\"{log}\"",
            " --mr_num_map_workers={num_map}",
            " --mr_reduce_workers={reducers}",
            " --mr_map_worker_id={id}",
            " --mr_map_only=true",
            " --mr_mapper_class={class}",
            " --mr_input_format={input_format}",
            " --mr_output_format={output_format}",
        ),
        exe = executable_invocation(config, rank),
        input = task.input_path,
        out = task.output_path,
        log = task.log_filebase,
        num_map = config.tasks.num_map_worker,
        reducers = reduce_workers_list(config),
        id = rank,
        class = task.user_class,
        input_format = task.input_format.expect("map-only task has an input format"),
        output_format = task.output_format.expect("map-only task has an output format"),
    )
}

/// Reducer: `num_reduce_buffer` is the count produced by the prepare pass
/// (see [`crate::agent::shuffle::prepare_reduce_buffers`]), 0 until batch
/// mode has run it.
pub fn reduce_worker_cmd(config: &GlobalConfig, rank: Rank, num_reduce_buffer: usize) -> String {
    let task = config.tasks.task(rank);
    let reduce_worker_id = config.tasks.local_rank(rank);
    let reduce_input_filebase = format!("{}/{}", task.input_path, config.job_identity);
    format!(
        concat!(
            "{exe}",
            " --mr_output_files=\"{out}\"",
            " --mr_batch_reduction={batch}",
            " --mr_reduce_input_filebase=\"{input_base}\"",
            " --mr_num_reduce_input_buffer_files={num_buf}",
            " --mr_log_filebase=\"{log}\"",
            " --mr_num_map_workers={num_map}",
            " --mr_reduce_workers={reducers}",
            " --mr_reduce_worker_id={id}",
            " --mr_reducer_class={class}",
            " --mr_output_format={output_format}",
        ),
        exe = executable_invocation(config, rank),
        out = task.output_path,
        batch = !config.incremental,
        input_base = reduce_input_filebase,
        num_buf = num_reduce_buffer,
        log = task.log_filebase,
        num_map = config.tasks.num_map_worker,
        reducers = reduce_workers_list(config),
        id = reduce_worker_id,
        class = task.user_class,
        output_format = task.output_format.expect("reducer task has an output format"),
    )
}
