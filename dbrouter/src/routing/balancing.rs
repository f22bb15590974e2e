use crate::cluster::ServerMode;

use super::Destination;

/// Rotation state of one route.
///
/// Writable and read-only destinations are rotated independently, each with
/// its own start offset, while a global offset decides which of the two groups
/// leads the list. Group sizes may change between calls, so every offset is
/// reduced modulo the current size before it is used.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct RoundRobinState {
    global: usize,
    read_write: usize,
    read_only: usize,
}

impl RoundRobinState {
    /// Orders `available` for one connection attempt and advances the offsets.
    pub(crate) fn balance(&mut self, available: Vec<Destination>) -> Vec<Destination> {
        if available.is_empty() {
            return available;
        }

        let global = self.global % available.len();
        let read_write_leads = available[global].mode() == ServerMode::ReadWrite;
        self.global = (global + 1) % available.len();

        let (read_write, read_only): (Vec<Destination>, Vec<Destination>) = available
            .into_iter()
            .partition(|destination| destination.mode() == ServerMode::ReadWrite);
        let read_write = rotate(read_write, &mut self.read_write);
        let read_only = rotate(read_only, &mut self.read_only);

        if read_write_leads {
            read_write.into_iter().chain(read_only).collect()
        } else {
            read_only.into_iter().chain(read_write).collect()
        }
    }
}

fn rotate(mut group: Vec<Destination>, offset: &mut usize) -> Vec<Destination> {
    if group.is_empty() {
        return group;
    }
    let start = *offset % group.len();
    group.rotate_left(start);
    *offset = (start + 1) % group.len();
    group
}
