//! Configuration surface: small value types controlling the reactor
//! backend, buffer block sizing, and session backpressure.

/// Which OS polling mechanism a `Cycle` uses.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ReactorKind {
    Epoll,
    Poll,
}

impl Default for ReactorKind {
    fn default() -> ReactorKind {
        ReactorKind::Epoll
    }
}

/// Tuning knobs for a `Cycle`'s event loop.
#[derive(Copy, Clone, Debug)]
pub struct CycleConfig {
    pub reactor: ReactorKind,
    /// Initial epoll `Events` batch capacity (ignored by the poll backend).
    pub initial_events_capacity: usize,
    /// Default poll wait time in microseconds when the timer heap is empty.
    pub default_wait_micros: u64,
}

impl Default for CycleConfig {
    fn default() -> CycleConfig {
        CycleConfig {
            reactor: ReactorKind::default(),
            initial_events_capacity: 16,
            default_wait_micros: 10_000,
        }
    }
}

/// Tuning knobs for a `Buffer`'s block chain.
#[derive(Copy, Clone, Debug)]
pub struct BufferConfig {
    /// Minimum block size; actual blocks are rounded up to the next power
    /// of two no smaller than this.
    pub min_block_size: usize,
    /// Below this many readable bytes in the head block, `read` realigns
    /// via `memmove` instead of chaining another block.
    pub realign_threshold: usize,
    /// Beyond this many blocks, `drain` releases freed blocks instead of
    /// keeping them on the reserve side.
    pub max_reserve_blocks: usize,
}

impl Default for BufferConfig {
    fn default() -> BufferConfig {
        BufferConfig {
            min_block_size: 4096,
            realign_threshold: 2048,
            max_reserve_blocks: 16,
        }
    }
}

/// Tuning knobs for a `Session`'s backpressure behavior.
#[derive(Copy, Clone, Debug)]
pub struct SessionConfig {
    /// Output-buffer byte count above which `high_water` fires.
    pub high_water_mark: usize,
    /// Maximum bytes read from the socket per `handle_read` call.
    pub max_read_bytes: usize,
}

impl Default for SessionConfig {
    fn default() -> SessionConfig {
        SessionConfig {
            high_water_mark: 64 * 1024 * 1024,
            max_read_bytes: 1024 * 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reactor_kind_defaults_to_epoll() {
        assert_eq!(ReactorKind::default(), ReactorKind::Epoll);
    }

    #[test]
    fn buffer_config_defaults_match_block_rounding_rules() {
        let cfg = BufferConfig::default();
        assert_eq!(cfg.min_block_size, 4096);
        assert_eq!(cfg.realign_threshold, 2048);
    }
}
