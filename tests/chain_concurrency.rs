//! Processing while the chain is being reconfigured from another thread.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use audiorig::{CaptureSession, EffectSpec};
use common::NullSource;
use rayon::iter::{IntoParallelIterator, ParallelIterator};

/// Every output must come from exactly one of these chains.
const GAINS: [f32; 3] = [2.0, 3.0, 5.0];
const INPUT: f32 = 0.01;

#[test]
fn process_never_sees_a_half_installed_chain() {
    let session = Arc::new(CaptureSession::new(NullSource).unwrap());
    // Two boosters per chain: a torn read would mix gains from different chains
    let specs = |gain: f32| [EffectSpec::booster(gain), EffectSpec::booster(gain)];
    session.configure_chain(&specs(GAINS[0])).unwrap();

    let done = Arc::new(AtomicBool::new(false));
    let writer = {
        let session = Arc::clone(&session);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            let mut installs = 0_usize;
            while !done.load(Ordering::Relaxed) {
                let gain = GAINS[installs % GAINS.len()];
                session.configure_chain(&specs(gain)).unwrap();
                installs += 1;
            }
            installs
        })
    };

    let allowed: Vec<f32> = GAINS.iter().map(|g| INPUT * g * g).collect();
    (0..2_000).into_par_iter().for_each(|_| {
        let out = session.process(vec![INPUT; 64]).unwrap();
        let first = out[0];
        assert!(
            allowed.iter().any(|&a| (a - first).abs() < 1e-6),
            "output {first} matches no installed chain"
        );
        assert!(out.iter().all(|&s| s == first), "chain changed mid-buffer");
    });

    done.store(true, Ordering::Relaxed);
    let installs = writer.join().unwrap();
    assert!(installs > 0);
    assert!(session.chain().version() as usize > installs);
}

#[test]
fn concurrent_edits_are_not_lost() {
    let session = Arc::new(CaptureSession::new(NullSource).unwrap());

    (0..64).into_par_iter().for_each(|_| {
        session.add_effect(EffectSpec::booster(1.0)).unwrap();
        let _ = session.process(vec![0.1; 32]).unwrap();
    });

    let chain = session.chain();
    assert_eq!(chain.len(), 64);
    assert_eq!(chain.version(), 64);
}

#[test]
fn session_can_be_shared_across_threads() {
    fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<CaptureSession<NullSource>>();
}
