//! Unsigned transaction bundle and signing.

use solana_sdk::compute_budget::ComputeBudgetInstruction;
use solana_sdk::hash::Hash;
use solana_sdk::instruction::Instruction;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::{Keypair, Signature};
use solana_sdk::transaction::Transaction;
use std::sync::Arc;
use thiserror::Error;

/// Errors raised while turning an [`UnsignedTransaction`] into wire bytes.
#[derive(Debug, Error)]
pub enum SigningError {
    #[error("signing failed: {0}")]
    Signer(#[from] solana_sdk::signer::SignerError),

    #[error("serialization failed: {0}")]
    Serialize(#[from] bincode::Error),

    #[error("transaction carries no signature")]
    Unsigned,
}

/// Instructions plus fee payer, not yet bound to a blockhash.
#[derive(Debug, Clone)]
pub struct UnsignedTransaction {
    instructions: Vec<Instruction>,
    fee_payer: Pubkey,
}

impl UnsignedTransaction {
    pub fn new(instructions: Vec<Instruction>, fee_payer: Pubkey) -> Self {
        Self {
            instructions,
            fee_payer,
        }
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    pub fn fee_payer(&self) -> Pubkey {
        self.fee_payer
    }

    /// Append an instruction after the existing ones.
    pub fn add_instruction(&mut self, instruction: Instruction) {
        self.instructions.push(instruction);
    }

    /// Append a compute-unit price instruction (priority fee).
    pub fn with_compute_unit_price(mut self, micro_lamports: u64) -> Self {
        if micro_lamports > 0 {
            self.add_instruction(ComputeBudgetInstruction::set_compute_unit_price(
                micro_lamports,
            ));
        }
        self
    }

    /// Sign against `blockhash` and serialize to wire format.
    pub fn sign(
        &self,
        signers: &[Arc<Keypair>],
        blockhash: Hash,
    ) -> Result<SignedTransaction, SigningError> {
        let mut tx = Transaction::new_with_payer(&self.instructions, Some(&self.fee_payer));
        let keypairs: Vec<&Keypair> = signers.iter().map(|k| k.as_ref()).collect();
        tx.try_sign(keypairs.as_slice(), blockhash)?;

        let signature = *tx.signatures.first().ok_or(SigningError::Unsigned)?;
        let wire = bincode::serialize(&tx)?;

        Ok(SignedTransaction {
            signature,
            wire: wire.into(),
        })
    }
}

/// Signed transaction ready for broadcast. Resends reuse the same bytes.
#[derive(Debug, Clone)]
pub struct SignedTransaction {
    pub signature: Signature,
    pub wire: Arc<[u8]>,
}
