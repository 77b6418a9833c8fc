//! Node wallet: key pair, balance, nonce counter and settled transactions

use crate::crypto::{utils::generate_keypair, KeyType, PrivateKey, PublicKey, Signature};
use crate::error::{BlockchatError, Result};
use crate::transaction::Transaction;
use std::path::Path;

/// The single wallet owned by a node.
///
/// Nodes keep the wallet behind one `tokio::sync::Mutex`, which serializes
/// every balance and nonce mutation.
#[derive(Debug)]
pub struct Wallet {
    public_key: PublicKey,
    private_key: PrivateKey,
    balance: i64,
    last_nonce: u64,
    transactions: Vec<Transaction>,
}

impl Wallet {
    /// Generate a fresh Ed25519 wallet
    pub fn new(initial_balance: i64) -> Self {
        Self::with_key_type(KeyType::Ed25519, initial_balance)
    }

    pub fn with_key_type(key_type: KeyType, initial_balance: i64) -> Self {
        let (private_key, _) = generate_keypair(key_type);
        Self::from_private_key(private_key, initial_balance)
    }

    pub fn from_private_key(private_key: PrivateKey, initial_balance: i64) -> Self {
        Self {
            public_key: private_key.public_key(),
            private_key,
            balance: initial_balance,
            last_nonce: 0,
            transactions: Vec::new(),
        }
    }

    /// Restore a wallet from a key file written by [`Wallet::save_key`]
    pub fn load_key(path: impl AsRef<Path>, initial_balance: i64) -> Result<Self> {
        let pem = std::fs::read_to_string(path)?;
        Ok(Self::from_private_key(PrivateKey::from_pem(&pem)?, initial_balance))
    }

    /// Write the private key as an armored base64 file
    pub fn save_key(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, self.private_key.to_pem())?;
        Ok(())
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    pub fn balance(&self) -> i64 {
        self.balance
    }

    pub fn last_nonce(&self) -> u64 {
        self.last_nonce
    }

    pub fn transactions(&self) -> &[Transaction] {
        &self.transactions
    }

    /// Advance the nonce counter and return the new value
    pub fn next_nonce(&mut self) -> u64 {
        self.last_nonce += 1;
        self.last_nonce
    }

    /// Apply `delta` to the balance; refuses any change that ends below zero.
    pub fn update_balance(&mut self, delta: i64) -> Result<i64> {
        let projected = self
            .balance
            .checked_add(delta)
            .ok_or_else(|| {
                BlockchatError::AmountOutOfRange(format!("balance {} + {}", self.balance, delta))
            })?;
        if projected < 0 {
            return Err(BlockchatError::InsufficientBalance {
                balance: self.balance,
                required: delta.saturating_neg(),
            });
        }
        self.balance = projected;
        Ok(projected)
    }

    /// Record a settled transaction
    pub fn record(&mut self, transaction: Transaction) {
        self.transactions.push(transaction);
    }

    /// Sign a content hash with this wallet's private key
    pub fn sign(&self, hash: &str) -> Signature {
        self.private_key.sign(hash.as_bytes())
    }

    /// True iff `signature` is valid for `hash` under `public_key`
    pub fn verify(hash: &str, signature: &Signature, public_key: &PublicKey) -> bool {
        public_key.verify(hash.as_bytes(), signature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::sha256_hex;

    #[test]
    fn test_nonce_strictly_increasing() {
        let mut wallet = Wallet::new(0);
        assert_eq!(wallet.last_nonce(), 0);
        assert_eq!(wallet.next_nonce(), 1);
        assert_eq!(wallet.next_nonce(), 2);
        assert_eq!(wallet.next_nonce(), 3);
    }

    #[test]
    fn test_update_balance_refuses_negative() {
        let mut wallet = Wallet::new(100);
        assert_eq!(wallet.update_balance(-40).unwrap(), 60);
        assert_eq!(wallet.update_balance(15).unwrap(), 75);

        let err = wallet.update_balance(-76).unwrap_err();
        assert!(matches!(
            err,
            BlockchatError::InsufficientBalance {
                balance: 75,
                required: 76
            }
        ));
        assert_eq!(wallet.balance(), 75);

        assert_eq!(wallet.update_balance(-75).unwrap(), 0);
    }

    #[test]
    fn test_update_balance_at_integer_limits() {
        let mut rich = Wallet::new(i64::MAX);
        assert!(matches!(
            rich.update_balance(1),
            Err(BlockchatError::AmountOutOfRange(_))
        ));
        assert_eq!(rich.balance(), i64::MAX);

        let mut wallet = Wallet::new(1000);
        assert!(matches!(
            wallet.update_balance(i64::MIN),
            Err(BlockchatError::InsufficientBalance { balance: 1000, .. })
        ));
        assert_eq!(wallet.balance(), 1000);
    }

    #[test]
    fn test_signature_round_trip_and_tampering() {
        let wallet = Wallet::new(0);
        let other = Wallet::new(0);
        let hash = sha256_hex(b"transfer");
        let signature = wallet.sign(&hash);

        assert!(Wallet::verify(&hash, &signature, wallet.public_key()));
        assert!(!Wallet::verify(&hash, &signature, other.public_key()));

        let mut tampered_hash = hash.clone().into_bytes();
        tampered_hash[0] = if tampered_hash[0] == b'0' { b'1' } else { b'0' };
        let tampered_hash = String::from_utf8(tampered_hash).unwrap();
        assert!(!Wallet::verify(&tampered_hash, &signature, wallet.public_key()));

        let mut sig_bytes = signature.to_bytes();
        sig_bytes[10] ^= 0x01;
        let tampered_sig = Signature::from_bytes(&sig_bytes, KeyType::Ed25519).unwrap();
        assert!(!Wallet::verify(&hash, &tampered_sig, wallet.public_key()));
    }

    #[test]
    fn test_secp256k1_wallet_signs() {
        let wallet = Wallet::with_key_type(KeyType::Secp256k1, 0);
        let hash = sha256_hex(b"x");
        assert!(Wallet::verify(&hash, &wallet.sign(&hash), wallet.public_key()));
    }

    #[test]
    fn test_key_material_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.key");

        let wallet = Wallet::new(10);
        wallet.save_key(&path).unwrap();
        let restored = Wallet::load_key(&path, 0).unwrap();

        assert_eq!(restored.public_key(), wallet.public_key());
        assert_eq!(restored.balance(), 0);
        let hash = sha256_hex(b"restored");
        assert!(Wallet::verify(&hash, &restored.sign(&hash), wallet.public_key()));
    }

    #[test]
    fn test_load_key_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            Wallet::load_key(dir.path().join("absent.key"), 0),
            Err(BlockchatError::Io(_))
        ));
    }
}
