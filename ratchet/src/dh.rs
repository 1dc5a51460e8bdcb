//! The DH ratchet state machine (§4.6): rotates X25519 keypairs whenever the
//! direction of messaging flips, maintaining a bounded ring of historical
//! peer ratchet epochs (`DhStep`s) so out-of-order and cross-epoch messages
//! still resolve to the right chain.

use std::collections::{HashMap, VecDeque};

use log::debug;
use serde::{Deserialize, Serialize};

use crate::chain::ChainKey;
use crate::primitives::{hkdf_expand_blocks, thumbprint, X25519Pub, X25519SecretKey};

const RATCHET_INFO: &[u8] = b"WhisperRatchet";

/// One DH ratchet epoch.
pub struct DhStep {
    pub remote_ratchet_key: X25519Pub,
    pub step_id: String,
    pub sending_chain: Option<ChainKey>,
    pub receiving_chain: Option<ChainKey>,
    /// -1 before any message has been decrypted under this step.
    pub last_decrypted_counter: i64,
}

/// `deriveChain(ourPriv, theirPub)`: advances the root key and returns a
/// fresh chain key, per §4.6. Both endpoints converge because X25519 is
/// commutative and both use the same (pre-advance) root key as HKDF salt.
pub fn derive_chain(
    our_priv: &X25519SecretKey,
    their_pub: &X25519Pub,
    current_root: &[u8; 32],
) -> ([u8; 32], ChainKey) {
    let dh = their_pub.diffie_hellman(our_priv);
    let blocks = hkdf_expand_blocks(&dh, Some(current_root), RATCHET_INFO, 2)
        .expect("fixed-length HKDF input/output never fails");
    (blocks[0], ChainKey::new(blocks[1]))
}

pub struct DhRatchet {
    pub local_ratchet: X25519SecretKey,
    pub root_key: [u8; 32],
    ring: VecDeque<String>,
    index: HashMap<String, DhStep>,
    pub current_step_id: Option<String>,
    /// Number of local ratchet key rotations so far ("session.counter").
    pub counter: u32,
    max_ratchet_steps: usize,
}

impl DhRatchet {
    pub fn new(local_ratchet: X25519SecretKey, root_key: [u8; 32], max_ratchet_steps: usize) -> Self {
        DhRatchet {
            local_ratchet,
            root_key,
            ring: VecDeque::new(),
            index: HashMap::new(),
            current_step_id: None,
            counter: 0,
            max_ratchet_steps,
        }
    }

    pub fn step(&self, step_id: &str) -> Option<&DhStep> {
        self.index.get(step_id)
    }

    pub fn step_mut(&mut self, step_id: &str) -> Option<&mut DhStep> {
        self.index.get_mut(step_id)
    }

    pub fn current_step(&self) -> Option<&DhStep> {
        self.current_step_id.as_deref().and_then(|id| self.index.get(id))
    }

    pub fn current_step_mut(&mut self) -> Option<&mut DhStep> {
        match self.current_step_id.clone() {
            Some(id) => self.index.get_mut(&id),
            None => None,
        }
    }

    pub fn has_ratchet_key(&self, pub_key: &X25519Pub) -> bool {
        self.index.contains_key(&thumbprint(pub_key))
    }

    /// Pushes a new DH step for a never-before-seen remote ratchet key.
    /// Returns the evicted step's id, if the ring was at capacity.
    pub fn push_step(&mut self, remote_ratchet_key: X25519Pub) -> (String, Option<String>) {
        let step_id = thumbprint(&remote_ratchet_key);
        let mut evicted = None;
        if self.ring.len() >= self.max_ratchet_steps {
            if let Some(oldest) = self.ring.pop_front() {
                self.index.remove(&oldest);
                evicted = Some(oldest);
            }
        }
        self.ring.push_back(step_id.clone());
        self.index.insert(
            step_id.clone(),
            DhStep {
                remote_ratchet_key,
                step_id: step_id.clone(),
                sending_chain: None,
                receiving_chain: None,
                last_decrypted_counter: -1,
            },
        );
        self.current_step_id = Some(step_id.clone());
        debug!("pushed new DH step {step_id}");
        (step_id, evicted)
    }

    /// Encrypt-side rotation: the current step has a receiving chain but no
    /// sending chain, so generate a new local ratchet keypair and build the
    /// sending chain against the current step's remote key.
    pub fn rotate_sending(&mut self) {
        let remote_key = match self.current_step() {
            Some(step) => step.remote_ratchet_key,
            None => return,
        };
        self.counter += 1;
        self.local_ratchet = X25519SecretKey::generate();
        let (new_root, chain) = derive_chain(&self.local_ratchet, &remote_key, &self.root_key);
        self.root_key = new_root;
        if let Some(step) = self.current_step_mut() {
            step.sending_chain = Some(chain);
        }
        debug!("rotated sending chain at counter {}", self.counter);
    }

    /// Decrypt-side rotation: build a receiving chain for a freshly pushed
    /// step using the still-current local ratchet private key. This does not
    /// rotate the local keypair, so it does not advance `counter` — only
    /// `rotate_sending`/`init_sending` mint a new local key.
    pub fn build_receiving_chain(&mut self, step_id: &str) {
        let remote_key = match self.step(step_id) {
            Some(step) => step.remote_ratchet_key,
            None => return,
        };
        let (new_root, chain) = derive_chain(&self.local_ratchet, &remote_key, &self.root_key);
        self.root_key = new_root;
        if let Some(step) = self.step_mut(step_id) {
            step.receiving_chain = Some(chain);
        }
        debug!("built receiving chain for step {step_id}");
    }

    /// Bootstraps the initiator's first sending chain: the ratchet's local
    /// keypair is the X3DH ephemeral `EK_A` (already set via [`DhRatchet::new`]);
    /// this pushes the single initial step keyed by the responder's signed
    /// pre-key and derives the sending chain against it. Used only at
    /// `createAsInitiator` time, before any message has been exchanged.
    pub fn init_sending(&mut self, remote_signed_pre_key: X25519Pub) -> String {
        let (step_id, _evicted) = self.push_step(remote_signed_pre_key);
        self.counter += 1;
        let (new_root, chain) = derive_chain(&self.local_ratchet, &remote_signed_pre_key, &self.root_key);
        self.root_key = new_root;
        self.index.get_mut(&step_id).unwrap().sending_chain = Some(chain);
        step_id
    }

    pub fn oldest_retained_counter_floor(&self) -> i64 {
        self.counter as i64 - self.max_ratchet_steps as i64
    }

    /// A persistable snapshot of all ratchet state, for [`crate::session::Session::serialize`].
    pub fn snapshot(&self) -> DhRatchetSnapshot {
        DhRatchetSnapshot {
            local_ratchet_secret: self.local_ratchet.to_bytes(),
            root_key: self.root_key,
            counter: self.counter,
            current_step_id: self.current_step_id.clone(),
            ring: self
                .ring
                .iter()
                .map(|id| {
                    let step = &self.index[id];
                    StepSnapshot {
                        remote_ratchet_key: step.remote_ratchet_key.0,
                        step_id: step.step_id.clone(),
                        sending_chain: step.sending_chain.map(|c| (c.counter, c.key)),
                        receiving_chain: step.receiving_chain.map(|c| (c.counter, c.key)),
                        last_decrypted_counter: step.last_decrypted_counter,
                    }
                })
                .collect(),
        }
    }

    pub fn from_snapshot(snapshot: DhRatchetSnapshot, max_ratchet_steps: usize) -> Self {
        let mut ring = VecDeque::new();
        let mut index = HashMap::new();
        for step in snapshot.ring {
            ring.push_back(step.step_id.clone());
            index.insert(
                step.step_id.clone(),
                DhStep {
                    remote_ratchet_key: X25519Pub(step.remote_ratchet_key),
                    step_id: step.step_id,
                    sending_chain: step.sending_chain.map(|(counter, key)| ChainKey { key, counter }),
                    receiving_chain: step.receiving_chain.map(|(counter, key)| ChainKey { key, counter }),
                    last_decrypted_counter: step.last_decrypted_counter,
                },
            );
        }
        DhRatchet {
            local_ratchet: X25519SecretKey::from_bytes(snapshot.local_ratchet_secret),
            root_key: snapshot.root_key,
            ring,
            index,
            current_step_id: snapshot.current_step_id,
            counter: snapshot.counter,
            max_ratchet_steps,
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct StepSnapshot {
    pub remote_ratchet_key: [u8; 32],
    pub step_id: String,
    pub sending_chain: Option<(u32, [u8; 32])>,
    pub receiving_chain: Option<(u32, [u8; 32])>,
    pub last_decrypted_counter: i64,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct DhRatchetSnapshot {
    pub local_ratchet_secret: [u8; 32],
    pub root_key: [u8; 32],
    pub counter: u32,
    pub current_step_id: Option<String>,
    pub ring: Vec<StepSnapshot>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_chain_converges_both_directions() {
        let a = X25519SecretKey::generate();
        let b = X25519SecretKey::generate();
        let root = [5u8; 32];
        let (root_a, chain_a) = derive_chain(&a, &b.public(), &root);
        let (root_b, chain_b) = derive_chain(&b, &a.public(), &root);
        assert_eq!(root_a, root_b);
        assert_eq!(chain_a.key, chain_b.key);
    }

    #[test]
    fn ring_evicts_oldest_step_on_overflow() {
        let mut ratchet = DhRatchet::new(X25519SecretKey::generate(), [0u8; 32], 2);
        let (id1, evicted1) = ratchet.push_step(X25519SecretKey::generate().public());
        assert!(evicted1.is_none());
        let (id2, evicted2) = ratchet.push_step(X25519SecretKey::generate().public());
        assert!(evicted2.is_none());
        let (_id3, evicted3) = ratchet.push_step(X25519SecretKey::generate().public());
        assert_eq!(evicted3, Some(id1));
        assert!(ratchet.step(&id1).is_none());
        assert!(ratchet.step(&id2).is_some());
    }
}
