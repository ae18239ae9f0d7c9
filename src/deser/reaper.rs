//! Background sweep of entries whose initiating loader was dropped.

use crossbeam::channel::Receiver;
use std::sync::Weak;
use std::thread::JoinHandle;

use super::Tables;
use crate::class::LoaderId;

#[derive(Debug)]
pub(crate) enum Notification {
    Unloaded(LoaderId),
    /// The owning cache is gone; the reaper stops.
    Released,
}

pub(crate) fn spawn(
    rx: Receiver<Notification>,
    tables: Weak<Tables>,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("class-cache-reaper".to_string())
        .spawn(move || {
            for notification in rx.iter() {
                match notification {
                    Notification::Released => break,
                    Notification::Unloaded(id) => {
                        let Some(tables) = tables.upgrade() else {
                            break;
                        };
                        tables.remove_stale(id);
                    }
                }
            }
        })
}
