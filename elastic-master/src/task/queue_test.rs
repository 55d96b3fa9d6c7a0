use std::collections::HashSet;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use super::queue::*;
use crate::error::AppError;
use crate::fixtures;
use crate::models::{ReportOutcome, TaskOutcome, TaskStatus};

fn failure(recoverable: bool) -> TaskOutcome {
    TaskOutcome::Failed {
        recoverable,
        message: "worker crashed".into(),
    }
}

#[test]
fn checkout_hands_out_each_task_once() -> Result<()> {
    let mut queue = TaskQueue::new(fixtures::dataset_spec("test"), fixtures::queue_policy())?;
    let now = Instant::now();

    let mut seen = HashSet::new();
    for idx in 0..10 {
        let worker = if idx % 2 == 0 { "worker-0" } else { "worker-1" };
        let task = queue.checkout(worker, now).context("expected a pending task")?;
        assert_eq!(task.status, TaskStatus::Assigned, "expected checked out task to be assigned");
        assert_eq!(task.worker_id.as_deref(), Some(worker), "expected task to record its worker");
        assert_eq!(task.deadline, Some(now + fixtures::queue_policy().task_timeout), "expected deadline to follow the task timeout");
        assert!(seen.insert(task.id), "task {} was handed out twice", task.id);
    }

    assert!(queue.checkout("worker-2", now).is_none(), "expected no task after the epoch was handed out");
    assert!(!queue.epoch_complete(), "expected epoch to be incomplete while tasks are in flight");
    Ok(())
}

#[test]
fn checkout_is_fifo_by_task_id() -> Result<()> {
    let mut queue = TaskQueue::new(fixtures::dataset_spec("test"), fixtures::queue_policy())?;
    let now = Instant::now();

    let ids: Vec<_> = (0..3).filter_map(|_| queue.checkout("worker-0", now)).map(|task| task.id).collect();

    assert_eq!(ids, vec![0, 1, 2], "expected tasks in ID order, got {:?}", ids);
    Ok(())
}

#[test]
fn reports_from_non_holders_are_stale() -> Result<()> {
    let mut queue = TaskQueue::new(fixtures::dataset_spec("test"), fixtures::queue_policy())?;
    let task = queue.checkout("worker-a", Instant::now()).context("expected a pending task")?;

    let outcome = queue.report(task.id, "worker-b", &TaskOutcome::Succeeded);
    assert_eq!(outcome, ReportOutcome::Stale, "expected report from another worker to be stale");

    let outcome = queue.report(task.id, "worker-a", &TaskOutcome::Succeeded);
    assert_eq!(outcome, ReportOutcome::Finished { records: 100 }, "expected report from the holder to finish the task");

    for (worker, outcome) in [("worker-a", TaskOutcome::Succeeded), ("worker-b", failure(true)), ("worker-b", failure(false))] {
        let res = queue.report(task.id, worker, &outcome);
        assert_eq!(res, ReportOutcome::Stale, "expected repeated report {:?} from {} to be stale", outcome, worker);
    }
    let status = queue.status();
    assert_eq!(status.finished, 1, "expected 1 finished task, got {}", status.finished);
    assert!(status.failed.is_empty(), "expected no failed tasks, got {:?}", status.failed);
    assert_eq!(queue.report(999, "worker-a", &TaskOutcome::Succeeded), ReportOutcome::Stale, "expected unknown task report to be stale");
    Ok(())
}

#[test]
fn recoverable_failures_retry_until_exhausted() -> Result<()> {
    let policy = fixtures::queue_policy();
    let mut queue = TaskQueue::new(fixtures::dataset_spec("test"), policy.clone())?;
    let now = Instant::now();

    let first = queue.checkout("worker-0", now).context("expected a pending task")?;
    let outcome = queue.report(first.id, "worker-0", &failure(true));
    assert_eq!(outcome, ReportOutcome::Requeued);
    let task = queue.task(first.id).context("expected task to still be tracked")?;
    assert_eq!((task.status, task.retry_count), (TaskStatus::Pending, 1), "unexpected task state {:?}", task);

    // The failed task goes to the back of the queue.
    let next = queue.checkout("worker-0", now).context("expected a pending task")?;
    assert_eq!(next.id, first.id + 1, "expected requeued task to be dispatched after older pending tasks");

    // Drain everything else, failing the retried task each time it comes around.
    queue.report(next.id, "worker-0", &TaskOutcome::Succeeded);
    let mut final_outcome = ReportOutcome::Requeued;
    while let Some(task) = queue.checkout("worker-0", now) {
        let outcome = if task.id == first.id { failure(true) } else { TaskOutcome::Succeeded };
        let res = queue.report(task.id, "worker-0", &outcome);
        if task.id == first.id {
            final_outcome = res;
        }
    }

    let task = queue.task(first.id).context("expected task to still be tracked")?;
    assert_eq!(final_outcome, ReportOutcome::Failed, "expected the last failure to be permanent");
    assert_eq!(task.status, TaskStatus::Failed, "expected task to be failed, got {:?}", task.status);
    assert_eq!(task.retry_count, policy.max_task_retries + 1, "unexpected retry count {}", task.retry_count);
    assert_eq!(queue.failed_tasks(), vec![first.id]);
    assert!(queue.epoch_complete(), "expected epoch with finished & failed tasks to be complete");
    assert!(queue.is_complete(), "expected single epoch dataset to be complete");
    Ok(())
}

#[test]
fn non_recoverable_failure_is_terminal() -> Result<()> {
    let mut queue = TaskQueue::new(fixtures::dataset_spec("test"), fixtures::queue_policy())?;
    let task = queue.checkout("worker-0", Instant::now()).context("expected a pending task")?;

    let outcome = queue.report(task.id, "worker-0", &failure(false));

    assert_eq!(outcome, ReportOutcome::Failed);
    let task = queue.task(task.id).context("expected task to still be tracked")?;
    assert_eq!((task.status, task.retry_count), (TaskStatus::Failed, 0), "unexpected task state {:?}", task);
    assert_eq!(queue.status().pending, 9, "expected failed task not to be requeued");
    Ok(())
}

#[test]
fn reclaim_timeouts_fail_task_once_retries_are_exhausted() -> Result<()> {
    let policy = fixtures::queue_policy();
    let mut spec = fixtures::dataset_spec("single");
    spec.dataset_size = 100;
    let mut queue = TaskQueue::new(spec, policy.clone())?;
    let mut now = Instant::now();

    let mut last = Reclaimed::default();
    for attempt in 0..=policy.max_task_retries {
        let task = queue.checkout("worker-slow", now).with_context(|| format!("expected the task on attempt {}", attempt))?;
        now += policy.task_timeout;
        last = queue.reclaim_timeouts(now);
        assert_eq!(last.len(), 1, "expected the task to time out on attempt {}, got {:?}", attempt, last);
        assert_eq!(last.requeued.first().or(last.failed.first()), Some(&task.id));
    }

    assert!(last.requeued.is_empty(), "expected the final timeout not to requeue, got {:?}", last);
    assert_eq!(last.failed.len(), 1, "expected the final timeout to fail the task, got {:?}", last);
    assert!(queue.checkout("worker-slow", now).is_none(), "expected the failed task not to be dispatched again");
    assert_eq!(queue.failed_tasks(), last.failed);
    assert!(queue.is_complete(), "expected dataset with only a failed task to be complete");
    Ok(())
}

#[test]
fn reclaim_timeouts_requeues_once_per_timeout() -> Result<()> {
    let policy = fixtures::queue_policy();
    let mut queue = TaskQueue::new(fixtures::dataset_spec("test"), policy.clone())?;
    let start = Instant::now();
    let task = queue.checkout("worker-a", start).context("expected a pending task")?;

    let early = queue.reclaim_timeouts(start + policy.task_timeout - Duration::from_secs(1));
    assert!(early.is_empty(), "expected no reclaim before the deadline, got {:?}", early);

    let expired_at = start + policy.task_timeout;
    let reclaimed = queue.reclaim_timeouts(expired_at);
    assert_eq!(reclaimed.requeued, vec![task.id], "expected the task to be reclaimed at its deadline");
    assert!(reclaimed.failed.is_empty(), "expected a retry to remain, got {:?}", reclaimed);
    assert!(queue.reclaim_timeouts(expired_at).is_empty(), "expected a single reclaim per timeout");

    let reclaimed = queue.task(task.id).context("expected task to still be tracked")?;
    assert_eq!((reclaimed.status, reclaimed.retry_count), (TaskStatus::Pending, 1), "unexpected task state {:?}", reclaimed);
    assert_eq!(queue.report(task.id, "worker-a", &TaskOutcome::Succeeded), ReportOutcome::Stale, "expected late report to be stale");
    Ok(())
}

#[test]
fn recover_worker_keeps_retry_budget() -> Result<()> {
    let mut queue = TaskQueue::new(fixtures::dataset_spec("test"), fixtures::queue_policy())?;
    let now = Instant::now();
    let a1 = queue.checkout("worker-a", now).context("expected a pending task")?;
    let b1 = queue.checkout("worker-b", now).context("expected a pending task")?;
    let a2 = queue.checkout("worker-a", now).context("expected a pending task")?;

    let recovered = queue.recover_worker("worker-a");

    assert_eq!(recovered, vec![a1.id, a2.id], "expected both tasks of worker-a to be recovered");
    for id in recovered {
        let task = queue.task(id).context("expected task to still be tracked")?;
        assert_eq!((task.status, task.retry_count), (TaskStatus::Pending, 0), "unexpected task state {:?}", task);
    }
    let held = queue.task(b1.id).context("expected task to still be tracked")?;
    assert_eq!(held.status, TaskStatus::Assigned, "expected worker-b's task to remain assigned");
    assert!(queue.recover_worker("worker-c").is_empty(), "expected nothing to recover for an idle worker");
    Ok(())
}

#[test]
fn enqueue_epoch_continues_ids_and_prunes_finished_tasks() -> Result<()> {
    let mut spec = fixtures::dataset_spec("test");
    spec.num_epochs = 2;
    let mut queue = TaskQueue::new(spec, fixtures::queue_policy())?;
    let now = Instant::now();
    while let Some(task) = queue.checkout("worker-0", now) {
        queue.report(task.id, "worker-0", &TaskOutcome::Succeeded);
    }
    assert!(queue.epoch_complete(), "expected epoch 0 to be complete");
    assert!(!queue.is_complete(), "expected dataset with a remaining epoch to be incomplete");

    let err = queue.enqueue_epoch(0).err().context("expected re-materializing epoch 0 to fail")?;
    assert!(matches!(err, AppError::InvalidInput(_)), "expected InvalidInput, got {:?}", err);
    assert_eq!(queue.enqueue_epoch(1)?, 10, "expected 10 tasks in epoch 1");

    assert!(queue.task(0).is_none(), "expected finished tasks of epoch 0 to be pruned");
    let task = queue.checkout("worker-0", now).context("expected a pending task")?;
    assert_eq!((task.id, task.shard.epoch), (10, 1), "expected IDs to continue across epochs, got {:?}", task);
    let err = queue.enqueue_epoch(2).err().context("expected epoch past num_epochs to fail")?;
    assert!(matches!(err, AppError::InvalidInput(_)), "expected InvalidInput, got {:?}", err);
    Ok(())
}

#[test]
fn restore_replays_in_flight_tasks() -> Result<()> {
    let policy = fixtures::queue_policy();
    let mut queue = TaskQueue::new(fixtures::dataset_spec("test"), policy.clone())?;
    let now = Instant::now();
    let finished = queue.checkout("worker-0", now).context("expected a pending task")?;
    let failed = queue.checkout("worker-0", now).context("expected a pending task")?;
    let in_flight = queue.checkout("worker-1", now).context("expected a pending task")?;
    queue.report(finished.id, "worker-0", &TaskOutcome::Succeeded);
    queue.report(failed.id, "worker-0", &failure(false));

    let checkpoint = queue.checkpoint();
    let mut restored = TaskQueue::restore(checkpoint.clone(), policy)?;

    assert_eq!(checkpoint.pending.len(), 8, "expected 7 pending & 1 in-flight task in checkpoint");
    assert_eq!(checkpoint.pending[0].id, in_flight.id, "expected in-flight tasks first in the checkpoint");
    let status = restored.status();
    assert_eq!((status.pending, status.assigned, status.finished), (8, 0, 1), "unexpected restored status {:?}", status);
    assert_eq!(status.failed, vec![failed.id], "expected failed tasks to survive a restore");
    assert_eq!(restored.pending_shards(), queue_order_after_restore(&queue), "expected restored dispatch order");

    let replayed = restored.checkout("worker-2", now).context("expected a pending task")?;
    assert_eq!(replayed.id, in_flight.id, "expected the in-flight task to be replayed first");
    Ok(())
}

/// The in-flight shards followed by the pending shards of the given queue.
fn queue_order_after_restore(queue: &TaskQueue) -> Vec<crate::models::Shard> {
    queue.checkpoint().pending.into_iter().map(|task| task.shard).collect()
}

#[test]
fn restore_rejects_checkpoint_past_last_epoch() {
    let queue = match TaskQueue::new(fixtures::dataset_spec("test"), fixtures::queue_policy()) {
        Ok(queue) => queue,
        Err(err) => panic!("error creating queue: {:?}", err),
    };
    let mut checkpoint = queue.checkpoint();
    checkpoint.epoch = 1;

    let res = TaskQueue::restore(checkpoint, fixtures::queue_policy());

    assert!(matches!(res, Err(AppError::InvalidInput(_))), "expected InvalidInput, got {:?}", res.map(|queue| queue.status()));
}
