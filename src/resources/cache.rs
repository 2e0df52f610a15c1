// Copyright (C) 2023 Tristan Gerritsen <tristan@thewoosh.org>
// All Rights Reserved.

use std::{
    collections::VecDeque,
    io,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use tokio::sync::watch;
use tracing::{debug, warn};

/// Listings older than this are rendered again, even when the directory
/// didn't change. This is 1 hour.
const MAX_AGE: Duration = Duration::from_secs(60 * 60);

/// A rendered directory listing. The `Arc` around it is the reference count:
/// an entry evicted from the cache stays alive for everyone still sending it.
#[derive(Debug)]
pub struct DirectoryListing {
    pub path: PathBuf,

    /// The modification time of the directory at render time, as an
    /// RFC 1123 date.
    pub mtime: String,

    pub html: Vec<u8>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ListingError {
    /// The directory couldn't be opened, answered with 403.
    Forbidden,

    /// Anything else, answered with 500.
    Internal,
}

impl From<io::Error> for ListingError {
    fn from(error: io::Error) -> Self {
        match error.kind() {
            io::ErrorKind::PermissionDenied | io::ErrorKind::NotFound => ListingError::Forbidden,
            _ => ListingError::Internal,
        }
    }
}

type Completion = Option<Result<Arc<DirectoryListing>, ListingError>>;

/// One slot in the cache list. The completion channel holds `None` while the
/// listing is under construction.
struct Slot {
    path: PathBuf,
    mtime: String,
    created: Instant,
    completion: watch::Receiver<Completion>,
}

impl Slot {
    fn is_usable(&self, mtime: &str) -> bool {
        if self.mtime != mtime || self.created.elapsed() >= MAX_AGE {
            return false;
        }
        !matches!(*self.completion.borrow(), Some(Err(_)))
    }
}

/// A cache of rendered directory listings shared by all worker threads.
///
/// The list is guarded by one lock that is only held while scanning. The
/// render itself happens on the blocking pool, and requests for a listing
/// that is still being rendered wait on that entry's own completion channel.
pub struct DirectoryCache {
    slots: Mutex<VecDeque<Arc<Slot>>>,
    capacity: usize,
}

impl DirectoryCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    /// Returns the listing of `path` for the given modification time,
    /// rendering it with `render` when there is no usable cached copy.
    pub async fn acquire<F>(&self, path: &Path, mtime: &str, render: F) -> Result<Arc<DirectoryListing>, ListingError>
    where
        F: FnOnce() -> io::Result<Vec<u8>> + Send + 'static,
    {
        let (slot, sender) = self.lookup(path, mtime)?;

        if let Some(sender) = sender {
            let path = path.to_owned();
            let mtime = mtime.to_owned();
            let render_job = tokio::task::spawn_blocking(move || {
                let result = render()
                    .map(|html| Arc::new(DirectoryListing { path, mtime, html }))
                    .map_err(|error| {
                        warn!("Failed to render directory listing: {error}");
                        ListingError::from(error)
                    });
                sender.send_replace(Some(result));
            });
            // The job stores its own result, so nothing waits on the handle.
            drop(render_job);
        }

        let mut completion = slot.completion.clone();
        let result = match completion.wait_for(Option::is_some).await {
            Ok(done) => done.clone().unwrap_or(Err(ListingError::Internal)),
            Err(_) => Err(ListingError::Internal),
        };

        if result.is_err() {
            self.remove(&slot);
        }
        result
    }

    /// Gives back a listing obtained from [`DirectoryCache::acquire`].
    pub fn release(&self, listing: Arc<DirectoryListing>) {
        debug!("Releasing listing of {}, {} holders left", listing.path.display(), Arc::strong_count(&listing) - 1);
        drop(listing);
    }

    /// Finds the slot for `path`, or inserts a new one under construction.
    /// The sender is returned when the caller has to render.
    fn lookup(&self, path: &Path, mtime: &str) -> Result<(Arc<Slot>, Option<watch::Sender<Completion>>), ListingError> {
        let mut slots = self.slots.lock().map_err(|_| ListingError::Internal)?;

        let mut index = 0;
        while index < slots.len() {
            if slots.len() > self.capacity {
                if let Some(evicted) = slots.pop_back() {
                    debug!("Evicting listing of {} from cache", evicted.path.display());
                }
                continue;
            }

            if slots[index].path == path {
                if slots[index].is_usable(mtime) {
                    debug!("Listing cache hit for {}", path.display());
                    return Ok((Arc::clone(&slots[index]), None));
                }
                debug!("Listing cache entry for {} is stale", path.display());
                slots.remove(index);
                break;
            }

            index += 1;
        }

        debug!("Listing cache miss for {}", path.display());
        let (sender, receiver) = watch::channel(None);
        let slot = Arc::new(Slot {
            path: path.to_owned(),
            mtime: mtime.to_owned(),
            created: Instant::now(),
            completion: receiver,
        });
        slots.push_front(Arc::clone(&slot));
        while slots.len() > self.capacity {
            slots.pop_back();
        }

        Ok((slot, Some(sender)))
    }

    fn remove(&self, slot: &Arc<Slot>) {
        if let Ok(mut slots) = self.slots.lock() {
            slots.retain(|other| !Arc::ptr_eq(other, slot));
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.slots.lock().map(|slots| slots.len()).unwrap_or(0)
    }
}
