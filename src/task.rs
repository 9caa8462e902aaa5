//! Scheduler-owned detached tasks.
//!
//! A spawned coroutine is boxed into a slab slot owned by the scheduler and
//! polled once synchronously on spawn (eager start). There is no join
//! surface: a task either runs to completion, after which its slot is freed,
//! or it is still parked when the scheduler is dropped and its frame is
//! dropped with it. A panic escaping a task body propagates out of the run
//! loop.

use parking_lot::Mutex;
use slab::Slab;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Wake, Waker};
use tracing::trace;

pub(crate) type TaskId = usize;

type TaskFuture = Pin<Box<dyn Future<Output = ()>>>;

/// Ids of tasks whose wakers have fired since the last drain.
///
/// This queue is the only piece of the task set that is genuinely
/// thread-safe, because `Waker` demands `Send + Sync` even though every wake
/// in this crate happens on the scheduler thread.
#[derive(Debug, Default)]
struct WokenQueue {
    ids: Mutex<VecDeque<TaskId>>,
}

impl WokenQueue {
    fn push(&self, id: TaskId) {
        self.ids.lock().push_back(id);
    }

    fn pop(&self) -> Option<TaskId> {
        self.ids.lock().pop_front()
    }
}

struct TaskWaker {
    id: TaskId,
    woken: Arc<WokenQueue>,
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.woken.push(self.id);
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.woken.push(self.id);
    }
}

/// The set of live tasks belonging to one scheduler.
///
/// Slots hold `Option` so a task can be taken out for the duration of a poll;
/// a poll may re-enter the set through `spawn` without touching its own slot.
pub(crate) struct Tasks {
    slots: RefCell<Slab<Option<TaskFuture>>>,
    woken: Arc<WokenQueue>,
}

impl Tasks {
    pub(crate) fn new() -> Self {
        Self {
            slots: RefCell::new(Slab::new()),
            woken: Arc::new(WokenQueue::default()),
        }
    }

    /// Insert a task and run it up to its first suspension point.
    pub(crate) fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + 'static,
    {
        let id = self.slots.borrow_mut().insert(Some(Box::pin(future)));
        trace!(id, "task spawned");
        self.poll_task(id);
    }

    /// Poll every task woken so far, including tasks woken by those polls.
    pub(crate) fn run_woken(&self) {
        while let Some(id) = self.woken.pop() {
            self.poll_task(id);
        }
    }

    fn poll_task(&self, id: TaskId) {
        // A stale wake may name a slot that has already been freed or even
        // reused; a spurious poll of a live future is allowed by contract.
        let Some(mut future) = self
            .slots
            .borrow_mut()
            .get_mut(id)
            .and_then(Option::take)
        else {
            return;
        };

        let waker = Waker::from(Arc::new(TaskWaker {
            id,
            woken: Arc::clone(&self.woken),
        }));
        let mut cx = Context::from_waker(&waker);

        match future.as_mut().poll(&mut cx) {
            Poll::Ready(()) => {
                self.slots.borrow_mut().remove(id);
                trace!(id, "task finished");
            }
            Poll::Pending => {
                if let Some(slot) = self.slots.borrow_mut().get_mut(id) {
                    *slot = Some(future);
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.slots.borrow().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::DropFlag;
    use std::cell::Cell;
    use std::rc::Rc;

    /// Future that stays pending once, stashing its waker.
    struct PendingOnce {
        polled: bool,
        waker: Rc<RefCell<Option<Waker>>>,
    }

    impl Future for PendingOnce {
        type Output = ();

        fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
            if self.polled {
                Poll::Ready(())
            } else {
                self.polled = true;
                *self.waker.borrow_mut() = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }

    #[test]
    fn spawn_is_eager() {
        let tasks = Tasks::new();
        let ran = Rc::new(Cell::new(false));

        let flag = Rc::clone(&ran);
        tasks.spawn(async move {
            flag.set(true);
        });

        // The body ran to completion during spawn, before any run loop.
        assert!(ran.get());
        assert_eq!(tasks.len(), 0);
    }

    #[test]
    fn woken_task_is_repolled_to_completion() {
        let tasks = Tasks::new();
        let waker = Rc::new(RefCell::new(None));

        tasks.spawn(PendingOnce {
            polled: false,
            waker: Rc::clone(&waker),
        });
        assert_eq!(tasks.len(), 1);

        waker
            .borrow_mut()
            .take()
            .expect("first poll stored a waker")
            .wake();
        tasks.run_woken();

        assert_eq!(tasks.len(), 0);
    }

    #[test]
    fn stale_wake_after_completion_is_ignored() {
        let tasks = Tasks::new();
        let waker = Rc::new(RefCell::new(None));

        tasks.spawn(PendingOnce {
            polled: false,
            waker: Rc::clone(&waker),
        });

        let waker = waker.borrow_mut().take().expect("waker stored");
        waker.wake_by_ref();
        tasks.run_woken();
        assert_eq!(tasks.len(), 0);

        // Second wake names a freed slot.
        waker.wake();
        tasks.run_woken();
        assert_eq!(tasks.len(), 0);
    }

    #[test]
    fn teardown_drops_parked_tasks() {
        let tasks = Tasks::new();
        let (guard, dropped) = DropFlag::new();

        tasks.spawn(async move {
            let _guard = guard;
            std::future::pending::<()>().await;
        });
        assert!(!dropped.get());

        drop(tasks);
        assert!(dropped.get());
    }
}
