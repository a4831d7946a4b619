//! Cooperative single-threaded executor
//!
//! One executor drives every guest in the sandbox. Tasks are polled only
//! when their waker fires, so a parked guest (empty pipe, full pipe,
//! waitpid, mailbox) costs nothing until the event that frees it.
//!
//! The API takes `&self` with interior mutability throughout: a task
//! being polled may spawn siblings or wake peers without re-entering a
//! held borrow.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::future::Future;
use std::rc::Rc;
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

use super::task::{BoxFuture, TaskId};

struct ManagedTask {
    id: TaskId,
    future: BoxFuture,
}

/// Shared state for a waker to signal task readiness
struct WakerState {
    task_id: TaskId,
    ready_set: Rc<RefCell<HashSet<TaskId>>>,
}

pub struct Executor {
    /// All live tasks, indexed by ID
    tasks: RefCell<BTreeMap<TaskId, ManagedTask>>,
    /// Tasks whose waker has fired since they were last polled
    ready: Rc<RefCell<HashSet<TaskId>>>,
    /// Tasks spawned while a tick is in progress
    pending_spawn: RefCell<VecDeque<ManagedTask>>,
    next_id: Cell<u64>,
}

impl Executor {
    pub fn new() -> Self {
        Self {
            tasks: RefCell::new(BTreeMap::new()),
            ready: Rc::new(RefCell::new(HashSet::new())),
            pending_spawn: RefCell::new(VecDeque::new()),
            next_id: Cell::new(0),
        }
    }

    /// Spawn a future, returning its task ID. Safe to call from inside a
    /// running task.
    pub fn spawn<F>(&self, future: F) -> TaskId
    where
        F: Future<Output = ()> + 'static,
    {
        let id = TaskId(self.next_id.get());
        self.next_id.set(id.0 + 1);

        self.pending_spawn.borrow_mut().push_back(ManagedTask {
            id,
            future: Box::pin(future),
        });
        self.ready.borrow_mut().insert(id);
        id
    }

    fn integrate_pending(&self) {
        loop {
            let Some(task) = self.pending_spawn.borrow_mut().pop_front() else {
                break;
            };
            self.tasks.borrow_mut().insert(task.id, task);
        }
    }

    /// Poll every ready task once, in ID order. Returns how many were
    /// polled.
    pub fn tick(&self) -> usize {
        self.integrate_pending();

        let mut ready_ids: Vec<TaskId> = self.ready.borrow().iter().copied().collect();
        ready_ids.sort();

        let mut polled = 0;
        for task_id in ready_ids {
            self.ready.borrow_mut().remove(&task_id);

            let Some(mut task) = self.tasks.borrow_mut().remove(&task_id) else {
                continue;
            };

            let waker = self.create_waker(task_id);
            let mut cx = Context::from_waker(&waker);

            match task.future.as_mut().poll(&mut cx) {
                Poll::Ready(()) => {
                    polled += 1;
                }
                Poll::Pending => {
                    // Parked; the waker puts it back in the ready set.
                    self.tasks.borrow_mut().insert(task_id, task);
                    polled += 1;
                }
            }
        }

        self.integrate_pending();
        polled
    }

    /// Tick until no task is ready. Parked tasks stay parked; the caller
    /// decides what event (timer, external wake) comes next.
    pub fn run_until_stalled(&self) {
        loop {
            self.integrate_pending();
            if self.ready.borrow().is_empty() && self.pending_spawn.borrow().is_empty() {
                break;
            }
            self.tick();
        }
    }

    pub fn has_tasks(&self) -> bool {
        !self.tasks.borrow().is_empty() || !self.pending_spawn.borrow().is_empty()
    }

    pub fn task_count(&self) -> usize {
        self.tasks.borrow().len() + self.pending_spawn.borrow().len()
    }

    /// Mark a task ready by ID. Returns whether the task exists.
    pub fn wake_task(&self, task_id: TaskId) -> bool {
        let exists = self.tasks.borrow().contains_key(&task_id)
            || self.pending_spawn.borrow().iter().any(|t| t.id == task_id);
        if exists {
            self.ready.borrow_mut().insert(task_id);
        }
        exists
    }

    /// Drop a task without polling it again.
    pub fn remove_task(&self, task_id: TaskId) {
        self.tasks.borrow_mut().remove(&task_id);
        self.ready.borrow_mut().remove(&task_id);
        self.pending_spawn.borrow_mut().retain(|t| t.id != task_id);
    }

    /// Drop every task. Used on sandbox disposal.
    pub fn clear(&self) {
        self.tasks.borrow_mut().clear();
        self.ready.borrow_mut().clear();
        self.pending_spawn.borrow_mut().clear();
    }

    fn create_waker(&self, task_id: TaskId) -> Waker {
        let state = Box::new(WakerState {
            task_id,
            ready_set: self.ready.clone(),
        });
        let ptr = Box::into_raw(state) as *const ();
        let raw = RawWaker::new(ptr, &WAKER_VTABLE);
        unsafe { Waker::from_raw(raw) }
    }
}

impl Default for Executor {
    fn default() -> Self {
        Self::new()
    }
}

const WAKER_VTABLE: RawWakerVTable =
    RawWakerVTable::new(waker_clone, waker_wake, waker_wake_by_ref, waker_drop);

unsafe fn waker_clone(ptr: *const ()) -> RawWaker {
    unsafe {
        let state = &*(ptr as *const WakerState);
        let cloned = Box::new(WakerState {
            task_id: state.task_id,
            ready_set: state.ready_set.clone(),
        });
        RawWaker::new(Box::into_raw(cloned) as *const (), &WAKER_VTABLE)
    }
}

unsafe fn waker_wake(ptr: *const ()) {
    unsafe {
        let state = Box::from_raw(ptr as *mut WakerState);
        state.ready_set.borrow_mut().insert(state.task_id);
    }
}

unsafe fn waker_wake_by_ref(ptr: *const ()) {
    unsafe {
        let state = &*(ptr as *const WakerState);
        state.ready_set.borrow_mut().insert(state.task_id);
    }
}

unsafe fn waker_drop(ptr: *const ()) {
    unsafe {
        drop(Box::from_raw(ptr as *mut WakerState));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_spawn_returns_unique_ids() {
        let exec = Executor::new();
        let id1 = exec.spawn(async {});
        let id2 = exec.spawn(async {});
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_task_runs_to_completion() {
        let exec = Executor::new();
        let ran = Rc::new(Cell::new(false));
        let ran_clone = ran.clone();

        exec.spawn(async move {
            ran_clone.set(true);
        });

        exec.run_until_stalled();
        assert!(ran.get());
        assert!(!exec.has_tasks());
    }

    #[test]
    fn test_tick_returns_polled_count() {
        let exec = Executor::new();
        exec.spawn(async {});
        exec.spawn(async {});
        assert_eq!(exec.tick(), 2);
    }

    #[test]
    fn test_parked_task_waits_for_wake() {
        let exec = Executor::new();
        let counter = Rc::new(Cell::new(0));
        let counter_clone = counter.clone();

        let id = exec.spawn(async move {
            counter_clone.set(counter_clone.get() + 1);
            futures::pending!(); // park without a wake source
            counter_clone.set(counter_clone.get() + 1);
        });

        exec.run_until_stalled();
        assert_eq!(counter.get(), 1);
        assert!(exec.has_tasks());

        // Not ready: tick does nothing.
        assert_eq!(exec.tick(), 0);
        assert_eq!(counter.get(), 1);

        assert!(exec.wake_task(id));
        exec.run_until_stalled();
        assert_eq!(counter.get(), 2);
        assert!(!exec.has_tasks());
    }

    #[test]
    fn test_wake_nonexistent_task() {
        let exec = Executor::new();
        assert!(!exec.wake_task(TaskId(9999)));
    }

    #[test]
    fn test_spawn_from_inside_task() {
        let exec = Rc::new(Executor::new());
        let inner_ran = Rc::new(Cell::new(false));

        let exec_clone = exec.clone();
        let flag = inner_ran.clone();
        exec.spawn(async move {
            exec_clone.spawn(async move {
                flag.set(true);
            });
        });

        exec.run_until_stalled();
        assert!(inner_ran.get());
    }

    #[test]
    fn test_clear_drops_everything() {
        let exec = Executor::new();
        exec.spawn(async {
            futures::pending!();
        });
        exec.run_until_stalled();
        assert!(exec.has_tasks());
        exec.clear();
        assert!(!exec.has_tasks());
    }
}
