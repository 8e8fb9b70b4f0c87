use tracing::trace;

/// Memoizes one scalar for the duration of a simulation step.
///
/// The value is recomputed only when asked for a step other than the one it
/// was last computed at; nothing else invalidates it.
pub struct ValueCache<F> {
    compute: F,
    cached: Option<(u64, f64)>,
}

impl<F: FnMut() -> f64> ValueCache<F> {
    pub fn new(compute: F) -> Self {
        Self {
            compute,
            cached: None,
        }
    }

    pub fn get_value(&mut self, step: u64) -> f64 {
        match self.cached {
            Some((cached_step, value)) if cached_step == step => {
                trace!(step, value, "Value cache hit");
                value
            }
            _ => {
                let value = (self.compute)();
                trace!(step, value, "Value cache recomputed");
                self.cached = Some((step, value));
                value
            }
        }
    }

    /// The last computed value and the step it belongs to.
    pub fn peek(&self) -> Option<(u64, f64)> {
        self.cached
    }
}

impl<F> std::fmt::Debug for ValueCache<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValueCache")
            .field("cached", &self.cached)
            .finish_non_exhaustive()
    }
}
