//! Periodic task sets on real threads: launch, run briefly, shut down.

use std::ops::ControlFlow;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use rt_harness::config::{HarnessConfig, Mode, WorkloadConfig};
use rt_harness::launch::{launch, periodic_scheduler, MULTI_PRIORITIES};
use rt_harness::logging::init_test_logging;
use rt_harness::queue::{BindTimeout, QueueOptions};
use rt_harness::runtime::Runtime;
use rt_harness::task::{TaskDescriptor, TaskState};
use rt_harness::time::{subtract, Duration};

fn light_config(mode: Mode) -> HarnessConfig {
    let mut config = HarnessConfig::default();
    config.mode = mode;
    config.period_ms = 5;
    config.boot_iter = 2;
    config.workload = WorkloadConfig {
        lower: 0.0,
        upper: 10.0,
        sub_intervals: 1_000,
    };
    config
}

#[test]
fn jitter_mode_runs_until_shutdown() {
    init_test_logging();
    let mut runtime = Runtime::new("jitter-test");
    let handles = launch(&mut runtime, &light_config(Mode::Jitter)).unwrap();
    assert_eq!(handles.len(), 1);
    assert_eq!(
        runtime.descriptor(handles[0]).map(|d| d.name.as_str()),
        Some("jitter-test")
    );

    thread::sleep(std::time::Duration::from_millis(50));
    assert_eq!(runtime.state(handles[0]), Some(TaskState::Running));

    let reports = runtime.shutdown();
    assert!(reports[0].result.is_ok());
    assert_eq!(runtime.state(handles[0]), Some(TaskState::Terminated));
}

#[test]
fn multi_mode_registers_three_ranked_tasks() {
    init_test_logging();
    let mut runtime = Runtime::new("proc");
    let handles = launch(&mut runtime, &light_config(Mode::Multi)).unwrap();
    assert_eq!(handles.len(), 3);

    for (handle, (suffix, priority)) in handles.iter().zip(MULTI_PRIORITIES) {
        let desc = runtime.descriptor(*handle).unwrap();
        assert_eq!(desc.name, format!("proc-{suffix}"));
        assert_eq!(desc.priority, priority);
    }

    thread::sleep(std::time::Duration::from_millis(30));
    let reports = runtime.shutdown();
    assert_eq!(reports.len(), 3);
    assert!(reports.iter().all(|r| r.result.is_ok()));
}

#[test]
fn out_of_range_priority_is_a_start_error() {
    let mut config = light_config(Mode::Jitter);
    config.priority = Some(0);

    let mut runtime = Runtime::new("bad-prio");
    let err = launch(&mut runtime, &config).unwrap_err();
    assert!(err.is_resource_error());
    assert!(err.to_string().contains("priority"));
}

#[test]
fn periodic_template_schedule_is_drift_free() {
    init_test_logging();
    let config = light_config(Mode::Jitter);
    let mut runtime = Runtime::new("drift");
    let handle = runtime
        .register(TaskDescriptor::new("ticker", Duration::from_millis(2)))
        .unwrap();

    let activations = Arc::new(AtomicU64::new(0));
    let seen = Arc::clone(&activations);
    runtime
        .start(handle, move |ctx| {
            let mut scheduler = periodic_scheduler(&ctx, &config)?;
            let mut previous = None;
            scheduler.run(ctx.shutdown(), |activation| {
                if let Some(prev) = previous {
                    assert_eq!(subtract(activation.scheduled, prev), ctx.period());
                }
                previous = Some(activation.scheduled);
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(if activation.index == 20 {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                })
            })?;
            Ok(())
        })
        .unwrap();

    let reports = runtime.join_all();
    assert!(reports[0].result.is_ok());
    assert_eq!(activations.load(Ordering::SeqCst), 20);
}

#[test]
fn producer_and_consumer_tasks_share_a_queue() {
    init_test_logging();
    let mut runtime = Runtime::new("queues");
    let producer = runtime
        .register(TaskDescriptor::new("producer", Duration::from_millis(1)))
        .unwrap();
    let consumer = runtime
        .register(TaskDescriptor::new("consumer", Duration::from_millis(1)))
        .unwrap();

    let tx = runtime
        .queues()
        .create("numbers", QueueOptions::bounded(2))
        .unwrap();
    let rx = runtime
        .queues()
        .bind("numbers", BindTimeout::NonBlocking)
        .unwrap();

    let received = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    runtime
        .start(consumer, move |_| {
            while let Some(message) = rx.receive() {
                sink.lock().push(message.as_text().unwrap_or_default().to_string());
            }
            Ok(())
        })
        .unwrap();
    runtime
        .start(producer, move |_| {
            for i in 0..50 {
                tx.send(i.to_string())?;
            }
            tx.close();
            Ok(())
        })
        .unwrap();

    assert!(runtime.join_all().iter().all(|r| r.result.is_ok()));
    let expected: Vec<String> = (0..50).map(|i| i.to_string()).collect();
    assert_eq!(*received.lock(), expected);
    assert!(runtime.queues().is_empty());
}
