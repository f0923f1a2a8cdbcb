//! # Launch
//!
//! Builds the task set of each [`Mode`] on a [`Runtime`]: descriptors from
//! the deployment config, one periodic template per task, and the queue
//! wiring of the pipeline.
//!
//! | Mode       | Tasks                                   | Priorities        |
//! |------------|-----------------------------------------|-------------------|
//! | `jitter`   | `<process>`                             | configured        |
//! | `multi`    | `<process>-a`, `<process>-b`, `<process>-c` | 20 / 50 / 75  |
//! | `pipeline` | `sensor`, `processing`, `storage`       | configured        |
//!
//! Priorities only reach the OS when `priority` is configured, which
//! switches every task to `SCHED_FIFO`. Otherwise they are ranks.
//!
//! Everything that can fail for resource reasons (files, queues, task
//! table) fails here, before the first task runs.

use std::ops::ControlFlow;

use crate::config::{HarnessConfig, Mode, MIN_RT_PRIORITY, PROCESSING_QUEUE, SENSOR_QUEUE};
use crate::error::Result;
use crate::pipeline::{
    processing_stage, sensor_stage, storage_stage, ResultSink, SensorFeed, WindowAverager,
};
use crate::queue::{BindTimeout, QueueOptions};
use crate::runtime::{Runtime, TaskContext, TaskHandle};
use crate::scheduler::{waiter_for, PeriodicScheduler, PeriodicWait};
use crate::task::{Affinity, SchedPolicy, TaskDescriptor};
use crate::workload::WorkloadSimulator;

/// Priorities of the three tasks of [`Mode::Multi`].
pub const MULTI_PRIORITIES: [(char, u8); 3] = [('a', 20), ('b', 50), ('c', 75)];

/// Register and start the tasks of `config.mode`.
pub fn launch(runtime: &mut Runtime, config: &HarnessConfig) -> Result<Vec<TaskHandle>> {
    match config.mode {
        Mode::Jitter => launch_jitter(runtime, config),
        Mode::Multi => launch_multi(runtime, config),
        Mode::Pipeline => launch_pipeline(runtime, config),
    }
}

fn descriptor(config: &HarnessConfig, name: &str, priority: u8) -> TaskDescriptor {
    let mut desc = TaskDescriptor::new(name, config.period()).with_priority(priority);
    if config.priority.is_some() {
        desc = desc.with_policy(SchedPolicy::Fifo);
    }
    if let Some(cpu) = config.cpu {
        desc = desc.with_affinity(Affinity::core(cpu));
    }
    desc
}

/// The periodic template every periodic task runs on.
pub fn periodic_scheduler(
    ctx: &TaskContext,
    config: &HarnessConfig,
) -> Result<PeriodicScheduler<Box<dyn PeriodicWait>>> {
    Ok(
        PeriodicScheduler::new(ctx.name(), ctx.period(), waiter_for(config.wait_mode)?)
            .with_boot_iter(config.boot_iter)
            .with_lag_warning(config.lag_warning()),
    )
}

fn start_workload_task(
    runtime: &mut Runtime,
    config: &HarnessConfig,
    handle: TaskHandle,
) -> Result<()> {
    let config = config.clone();
    runtime.start(handle, move |ctx| {
        let mut scheduler = periodic_scheduler(&ctx, &config)?;
        let mut workload = WorkloadSimulator::new(ctx.name(), config.workload);
        scheduler.run(ctx.shutdown(), |_| {
            workload.run();
            Ok(ControlFlow::Continue(()))
        })?;
        Ok(())
    })
}

fn launch_jitter(runtime: &mut Runtime, config: &HarnessConfig) -> Result<Vec<TaskHandle>> {
    let name = runtime.process().to_string();
    let priority = config.priority.unwrap_or(MIN_RT_PRIORITY);
    let handle = runtime.register(descriptor(config, &name, priority))?;
    start_workload_task(runtime, config, handle)?;
    Ok(vec![handle])
}

fn launch_multi(runtime: &mut Runtime, config: &HarnessConfig) -> Result<Vec<TaskHandle>> {
    let process = runtime.process().to_string();
    let handles = MULTI_PRIORITIES
        .iter()
        .map(|&(suffix, priority)| {
            runtime.register(descriptor(config, &format!("{process}-{suffix}"), priority))
        })
        .collect::<Result<Vec<_>>>()?;
    for &handle in &handles {
        start_workload_task(runtime, config, handle)?;
    }
    Ok(handles)
}

fn launch_pipeline(runtime: &mut Runtime, config: &HarnessConfig) -> Result<Vec<TaskHandle>> {
    let pipeline = &config.pipeline;
    let priority = config.priority.unwrap_or(MIN_RT_PRIORITY);

    let mut feed = SensorFeed::open(&pipeline.input)?;
    let mut sink = ResultSink::create(&pipeline.output)?;

    let options = QueueOptions::bounded(pipeline.queue_capacity);
    let samples_out = runtime.queues().create(SENSOR_QUEUE, options)?;
    let means_out = runtime.queues().create(PROCESSING_QUEUE, options)?;
    let samples_in = runtime.queues().bind(SENSOR_QUEUE, BindTimeout::NonBlocking)?;
    let means_in = runtime.queues().bind(PROCESSING_QUEUE, BindTimeout::NonBlocking)?;

    let sensor = runtime.register(descriptor(config, "sensor", priority))?;
    let processing = runtime.register(descriptor(config, "processing", priority))?;
    let storage = runtime.register(descriptor(config, "storage", priority))?;

    runtime.start(storage, move |_| {
        storage_stage(&means_in, &mut sink)?;
        Ok(())
    })?;
    runtime.start(processing, move |_| {
        let mut averager = WindowAverager::default();
        processing_stage(&samples_in, &means_out, &mut averager)?;
        Ok(())
    })?;

    let config = config.clone();
    runtime.start(sensor, move |ctx| {
        let mut scheduler = periodic_scheduler(&ctx, &config)?;
        sensor_stage(
            &mut scheduler,
            ctx.shutdown(),
            &mut feed,
            &samples_out,
            config.pipeline.stop_at_end_of_input,
        )?;
        Ok(())
    })?;

    Ok(vec![sensor, processing, storage])
}
