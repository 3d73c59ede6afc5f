//! Effect chains
//!
//! An [`EffectChain`] is an immutable, ordered snapshot of effects. The
//! [`ChainStore`] holds the current snapshot behind a lock-free shared cell:
//! readers take one atomic load and keep that snapshot for the whole call,
//! writers build a replacement and install it in a single swap. Retired
//! snapshots are handed to the reclaimer thread instead of being freed by
//! whichever reader drops them last.

use std::sync::{Arc, Mutex, PoisonError};

use basedrop::{Handle, Shared, SharedCell};

use crate::effects::{ConfigError, Effect, EffectKind, EffectSpec, ProcessingError};

/// Ordered list of effects; insertion order is processing order.
///
/// Cloning is cheap and shares the effect instances, including their state.
#[derive(Debug, Clone, Default)]
pub struct EffectChain {
    effects: Vec<Arc<Effect>>,
    version: u64,
}

impl EffectChain {
    /// An empty chain, which passes audio through unchanged.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build every effect in `specs`, failing on the first invalid one.
    pub fn from_specs(specs: &[EffectSpec], sample_rate: u32) -> Result<Self, ConfigError> {
        let effects = specs
            .iter()
            .map(|spec| spec.build(sample_rate).map(Arc::new))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(EffectChain {
            effects,
            version: 0,
        })
    }

    /// Number of effects.
    pub fn len(&self) -> usize {
        self.effects.len()
    }

    /// `true` for a pass-through chain.
    pub fn is_empty(&self) -> bool {
        self.effects.is_empty()
    }

    /// Install counter of the store this snapshot came from; `0` if never installed.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Effects in processing order.
    pub fn effects(&self) -> impl Iterator<Item = &Effect> + '_ {
        self.effects.iter().map(|e| e.as_ref())
    }

    /// Parameters of every effect, in order.
    pub fn specs(&self) -> Vec<EffectSpec> {
        self.effects().map(Effect::spec).collect()
    }

    /// Variants of every effect, in order.
    pub fn kinds(&self) -> Vec<EffectKind> {
        self.effects().map(Effect::kind).collect()
    }

    /// Run a copy of `input` through every effect in order.
    pub fn process(&self, input: &[f32]) -> Result<Vec<f32>, ProcessingError> {
        let mut buffer = input.to_vec();
        self.process_in_place(&mut buffer)?;
        Ok(buffer)
    }

    /// Run `buffer` through every effect in order. On error the buffer holds
    /// whatever the failing effect received and no effect state changes.
    pub fn process_in_place(&self, buffer: &mut [f32]) -> Result<(), ProcessingError> {
        let mut pending = Vec::with_capacity(self.effects.len());
        for effect in &self.effects {
            pending.push(effect.render(buffer)?);
        }
        for (effect, state) in self.effects.iter().zip(pending) {
            effect.commit(state);
        }
        Ok(())
    }

    /// Clear carried state (compressor envelopes) of every effect.
    pub fn reset(&self) {
        for effect in &self.effects {
            effect.reset();
        }
    }

    /// Copy of this chain with `effect` appended.
    pub fn with_effect(&self, effect: Effect) -> Self {
        let mut next = self.clone();
        next.effects.push(Arc::new(effect));
        next
    }

    /// Copy of this chain without the effect at `index`.
    pub fn without(&self, index: usize) -> Result<Self, ConfigError> {
        self.check_index(index)?;
        let mut next = self.clone();
        next.effects.remove(index);
        Ok(next)
    }

    /// Copy of this chain with the effect at `from` moved to position `to`.
    pub fn moved(&self, from: usize, to: usize) -> Result<Self, ConfigError> {
        self.check_index(from)?;
        self.check_index(to)?;
        let mut next = self.clone();
        let effect = next.effects.remove(from);
        next.effects.insert(to, effect);
        Ok(next)
    }

    /// Copy of this chain rearranged so position `i` holds the effect
    /// currently at `order[i]`. `order` must be a permutation of `0..len`.
    pub fn reordered(&self, order: &[usize]) -> Result<Self, ConfigError> {
        if order.len() != self.len() {
            return Err(ConfigError::InvalidOrder(format!(
                "expected {} indices, got {}",
                self.len(),
                order.len()
            )));
        }
        let mut seen = vec![false; self.len()];
        for &index in order {
            self.check_index(index)?;
            if std::mem::replace(&mut seen[index], true) {
                return Err(ConfigError::InvalidOrder(format!(
                    "index {index} appears more than once"
                )));
            }
        }

        let effects = order.iter().map(|&i| Arc::clone(&self.effects[i])).collect();
        Ok(EffectChain {
            effects,
            version: self.version,
        })
    }

    fn check_index(&self, index: usize) -> Result<(), ConfigError> {
        if index >= self.len() {
            return Err(ConfigError::IndexOutOfRange {
                index,
                len: self.len(),
            });
        }
        Ok(())
    }
}

/// Holder of the current chain snapshot.
pub struct ChainStore {
    current: SharedCell<EffectChain>,
    handle: Handle,
    writer: Mutex<()>,
    sample_rate: u32,
}

impl ChainStore {
    /// Start with an empty chain. Effects are built for `sample_rate`, and
    /// retired snapshots are queued on `handle`'s collector.
    pub fn new(handle: Handle, sample_rate: u32) -> Self {
        let current = SharedCell::new(Shared::new(&handle, EffectChain::new()));
        ChainStore {
            current,
            handle,
            writer: Mutex::new(()),
            sample_rate,
        }
    }

    /// Sample rate effects are built for.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// The installed snapshot. Lock-free.
    pub fn load(&self) -> Shared<EffectChain> {
        self.current.get()
    }

    /// Process `buffer` with the snapshot installed at the time of the call.
    pub fn process(&self, buffer: &mut [f32]) -> Result<(), ProcessingError> {
        let chain = self.load();
        chain.process_in_place(buffer)
    }

    /// Replace the whole chain. Nothing is installed if any spec is invalid.
    pub fn configure(&self, specs: &[EffectSpec]) -> Result<(), ConfigError> {
        let chain = EffectChain::from_specs(specs, self.sample_rate)?;
        self.update(|_| Ok(chain))
    }

    /// Append one effect.
    pub fn add_effect(&self, spec: EffectSpec) -> Result<(), ConfigError> {
        let effect = spec.build(self.sample_rate)?;
        self.update(|chain| Ok(chain.with_effect(effect)))
    }

    /// Remove the effect at `index`.
    pub fn remove_effect(&self, index: usize) -> Result<(), ConfigError> {
        self.update(|chain| chain.without(index))
    }

    /// Move the effect at `from` to position `to`.
    pub fn move_effect(&self, from: usize, to: usize) -> Result<(), ConfigError> {
        self.update(|chain| chain.moved(from, to))
    }

    /// Rearrange the chain by a permutation of its indices.
    pub fn reorder(&self, order: &[usize]) -> Result<(), ConfigError> {
        self.update(|chain| chain.reordered(order))
    }

    /// Clear the carried state of every effect in the installed chain.
    pub fn reset(&self) {
        self.load().reset();
    }

    /// Derive a new snapshot from the installed one and swap it in.
    /// Writers queue on `writer` so concurrent edits are not lost; readers
    /// never touch it.
    fn update<F>(&self, derive: F) -> Result<(), ConfigError>
    where
        F: FnOnce(&EffectChain) -> Result<EffectChain, ConfigError>,
    {
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.load();
        let mut next = derive(&current)?;
        next.version = current.version + 1;

        log::debug!(
            "installing effect chain v{} ({:?})",
            next.version,
            next.kinds()
        );
        let retired = self.current.replace(Shared::new(&self.handle, next));
        drop(retired);
        Ok(())
    }
}
