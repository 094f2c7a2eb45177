//! Batched page reads serviced by a small pool of worker threads.
//!
//! The pages of the first cluster of a batch are read on the calling thread;
//! the rest are queued on a bounded ring. Workers take runs of contiguous pages
//! of one cluster off the ring and service each run with a single cluster load.

use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};

use crate::cache::try_alloc;
use crate::error::{Error, Result};
use crate::footer::{page_offset, PAGE_SIZE};
use crate::fs::Engine;
use crate::inode::Inode;
use crate::lower::LowerFile;
use crate::read::read_span;

/// Pages the ring holds before callers have to service reads themselves.
pub const QUEUE_DEPTH: usize = 256;

enum PageState {
    Locked,
    Done(Result<Vec<u8>>),
    Taken,
}

/// One page of a batched read. Locked until serviced.
pub struct Page {
    index: u64,
    state: Mutex<PageState>,
    ready: Condvar,
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("index", &self.index)
            .field("locked", &self.is_locked())
            .finish()
    }
}

impl Page {
    fn new(index: u64) -> Arc<Page> {
        Arc::new(Page {
            index,
            state: Mutex::new(PageState::Locked),
            ready: Condvar::new(),
        })
    }

    #[inline(always)]
    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn is_locked(&self) -> bool {
        matches!(*self.state.lock(), PageState::Locked)
    }

    fn complete(&self, result: Result<Vec<u8>>) {
        *self.state.lock() = PageState::Done(result);
        self.ready.notify_all();
    }

    /// Blocks until the page is serviced and takes its contents: [`PAGE_SIZE`] bytes,
    /// zero past the end of the file.
    pub fn wait(&self) -> Result<Vec<u8>> {
        let mut state = self.state.lock();
        while matches!(*state, PageState::Locked) {
            self.ready.wait(&mut state);
        }

        match std::mem::replace(&mut *state, PageState::Taken) {
            PageState::Done(result) => result,
            _ => Err(Error::unsupported(format!(
                "page {} was already taken",
                self.index
            ))),
        }
    }
}

pub(crate) struct Job {
    inode: Arc<Inode>,
    lower: Arc<dyn LowerFile>,
    cluster: u64,
    page: Arc<Page>,
}

impl Job {
    /// Whether `next` continues the run ending with `self`.
    fn continued_by(&self, next: &Job) -> bool {
        Arc::ptr_eq(&self.inode, &next.inode)
            && self.cluster == next.cluster
            && self.page.index.checked_add(1) == Some(next.page.index)
    }
}

/// Fixed-capacity circular queue. `head == tail` is empty unless `full` is set.
struct Ring {
    slots: Vec<Option<Job>>,
    head: usize,
    tail: usize,
    full: bool,
    shutdown: bool,
}

impl Ring {
    fn new(capacity: usize) -> Ring {
        Ring {
            slots: (0..capacity.max(1)).map(|_| None).collect(),
            head: 0,
            tail: 0,
            full: false,
            shutdown: false,
        }
    }

    fn is_empty(&self) -> bool {
        self.head == self.tail && !self.full
    }

    fn push(&mut self, job: Job) -> std::result::Result<(), Job> {
        if self.full {
            return Err(job);
        }
        self.slots[self.tail] = Some(job);
        self.tail = (self.tail + 1) % self.slots.len();
        self.full = self.tail == self.head;
        Ok(())
    }

    fn peek(&self) -> Option<&Job> {
        if self.is_empty() {
            return None;
        }
        self.slots[self.head].as_ref()
    }

    fn pop(&mut self) -> Option<Job> {
        if self.is_empty() {
            return None;
        }
        let job = self.slots[self.head].take();
        self.head = (self.head + 1) % self.slots.len();
        self.full = false;
        job
    }

    /// Pops the next run of contiguous pages of one cluster.
    fn pop_run(&mut self) -> Vec<Job> {
        let mut run: Vec<Job> = Vec::new();
        while let Some(next) = self.peek() {
            if let Some(last) = run.last() {
                if !last.continued_by(next) {
                    break;
                }
            }
            match self.pop() {
                Some(job) => run.push(job),
                None => break,
            }
        }
        run
    }
}

struct Queue {
    ring: Mutex<Ring>,
    work: Condvar,
}

/// The worker pool and its queue.
pub(crate) struct ReadAhead {
    queue: Arc<Queue>,
    workers: Vec<JoinHandle<()>>,
}

impl ReadAhead {
    pub fn new(engine: Arc<Engine>, workers: usize) -> std::io::Result<ReadAhead> {
        let queue = Arc::new(Queue {
            ring: Mutex::new(Ring::new(QUEUE_DEPTH)),
            work: Condvar::new(),
        });

        let workers = (0..workers)
            .map(|n| {
                let engine = Arc::clone(&engine);
                let queue = Arc::clone(&queue);
                std::thread::Builder::new()
                    .name(format!("scfs-readahead-{}", n))
                    .spawn(move || worker(n, &engine, &queue))
            })
            .collect::<std::io::Result<Vec<_>>>()?;

        Ok(ReadAhead { queue, workers })
    }

    /// Queues `jobs`, handing back the ones that did not fit.
    fn submit(&self, jobs: Vec<Job>) -> Vec<Job> {
        let mut rejected = Vec::new();
        {
            let mut ring = self.queue.ring.lock();
            for job in jobs {
                if ring.shutdown {
                    rejected.push(job);
                    continue;
                }
                if let Err(job) = ring.push(job) {
                    rejected.push(job);
                }
            }
        }
        self.queue.work.notify_all();

        if !rejected.is_empty() {
            tracing::trace!(pages = rejected.len(), "read-ahead queue full");
        }
        rejected
    }
}

impl Drop for ReadAhead {
    fn drop(&mut self) {
        self.queue.ring.lock().shutdown = true;
        self.queue.work.notify_all();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

fn worker(n: usize, engine: &Engine, queue: &Queue) {
    tracing::debug!(worker = n, "read-ahead worker started");

    loop {
        let run = {
            let mut ring = queue.ring.lock();
            while ring.is_empty() && !ring.shutdown {
                queue.work.wait(&mut ring);
            }
            if ring.is_empty() {
                break;
            }
            ring.pop_run()
        };

        service(engine, run);
    }

    tracing::debug!(worker = n, "read-ahead worker stopped");
}

/// Services a run of contiguous pages of one cluster with a single read.
///
/// If the run fails as a whole, each page is retried on its own so that one bad
/// page does not fail its neighbours.
fn service(engine: &Engine, run: Vec<Job>) {
    let first = match run.first() {
        Some(first) => first,
        None => return,
    };

    let result = try_alloc(run.len() * PAGE_SIZE).and_then(|mut buf| {
        if let Some(pos) = page_offset(first.page.index) {
            read_span(engine, &first.inode, &*first.lower, pos, &mut buf)?;
        }
        Ok(buf)
    });

    match result {
        Ok(buf) => {
            tracing::trace!(
                inode = first.inode.id,
                cluster = first.cluster,
                first = first.page.index,
                pages = run.len(),
                "serviced pages"
            );
            for (job, page) in run.iter().zip(buf.chunks(PAGE_SIZE)) {
                job.page.complete(Ok(page.to_vec()));
            }
        }
        Err(err) => {
            tracing::debug!(
                inode = first.inode.id,
                cluster = first.cluster,
                error = %err,
                "batched read failed, servicing pages one by one"
            );
            for job in &run {
                job.page.complete(read_one(engine, job));
            }
        }
    }
}

fn read_one(engine: &Engine, job: &Job) -> Result<Vec<u8>> {
    let mut buf = try_alloc(PAGE_SIZE)?;
    if let Some(pos) = page_offset(job.page.index) {
        read_span(engine, &job.inode, &*job.lower, pos, &mut buf)?;
    }
    Ok(buf)
}

/// Reads `count` pages starting at page `first`, stopping short at the last
/// page index.
///
/// Returns once the pages of the first cluster are serviced; the rest complete
/// as the workers get to them. Without workers every page is serviced before
/// returning.
pub(crate) fn read_pages(
    engine: &Engine,
    readahead: Option<&ReadAhead>,
    inode: &Arc<Inode>,
    lower: &Arc<dyn LowerFile>,
    first: u64,
    count: usize,
) -> Vec<Arc<Page>> {
    let end = first.saturating_add(count as u64);
    let pages: Vec<Arc<Page>> = (first..end).map(Page::new).collect();
    if pages.is_empty() {
        return pages;
    }

    hint(engine, inode, &**lower, first, pages.len());
    let pages_per_cluster = (inode.cluster_size() as usize / PAGE_SIZE).max(1) as u64;
    let first_cluster = first / pages_per_cluster;

    let (sync, rest): (Vec<Job>, Vec<Job>) = pages
        .iter()
        .map(|page| Job {
            inode: Arc::clone(inode),
            lower: Arc::clone(lower),
            cluster: page.index / pages_per_cluster,
            page: Arc::clone(page),
        })
        .partition(|job| job.cluster == first_cluster);

    let rejected = match readahead {
        Some(readahead) if !rest.is_empty() => readahead.submit(rest),
        _ => rest,
    };

    service(engine, sync);
    service_runs(engine, rejected);
    pages
}

/// Services jobs on the calling thread, one run per cluster.
fn service_runs(engine: &Engine, jobs: Vec<Job>) {
    let mut run: Vec<Job> = Vec::new();
    for job in jobs {
        if let Some(last) = run.last() {
            if !last.continued_by(&job) {
                service(engine, std::mem::take(&mut run));
            }
        }
        run.push(job);
    }
    service(engine, run);
}

/// Tells the lower file which byte range the batch will touch.
fn hint(engine: &Engine, inode: &Inode, lower: &dyn LowerFile, first: u64, count: usize) {
    let mut meta = inode.meta.lock();
    if meta.ensure_valid(lower, &engine.options).is_err() || meta.size == 0 {
        return;
    }

    let start = match page_offset(first) {
        Some(start) if start < meta.size => start,
        _ => return,
    };
    let end = page_offset(first + count as u64).map_or(meta.size, |end| end.min(meta.size));

    if !meta.compressed {
        lower.readahead(start, end - start);
        return;
    }

    let cluster_size = meta.cluster_size as u64;
    let first_cluster = start / cluster_size;
    let last_cluster = (end - 1) / cluster_size;

    let lookup = |index| meta.table.get(index, meta.size, meta.cluster_size).ok();
    if let (Some(a), Some(b)) = (lookup(first_cluster), lookup(last_cluster)) {
        let from = a.offset as u64;
        let to = b.next_offset();
        if to > from {
            tracing::trace!(
                offset = format_args!("{:#x}", from),
                len = to - from,
                "read-ahead hint"
            );
            lower.readahead(from, to - from);
        }
    }
}
