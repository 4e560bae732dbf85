use crate::{Gpa, MigrationError};

/// A page encrypted by the guest for transfer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EncryptedPage {
    /// Opaque per-page metadata produced by the encryptor.
    pub header: Vec<u8>,

    /// The ciphertext, exactly one page long.
    pub data: Vec<u8>,
}

/// Page transformation for guests whose RAM the host cannot read.
///
/// The multifd channels call into this instead of reading host memory when
/// the guest is confidential. Every error is fatal for the migration.
pub trait PageEncryption: Send + Sync {
    /// Produces the ciphertext of the guest page at `gpa`.
    fn encrypt_page(&self, gpa: Gpa) -> Result<EncryptedPage, MigrationError>;

    /// Installs a page received from the source into the guest at `gpa`.
    fn decrypt_page(&self, gpa: Gpa, page: &EncryptedPage) -> Result<(), MigrationError>;
}
