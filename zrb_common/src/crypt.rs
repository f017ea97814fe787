// zrb_common is the main zrb library implementing the backup pipeline shared logic.
// Copyright (C) 2024  Himbeer <himbeerserverde@gmail.com>
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use crate::ZrbError;

use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Read, Write};
use std::iter;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::str::FromStr;

use age::secrecy::ExposeSecret;
use age::x25519::{Identity, Recipient};
use chrono::prelude::*;

/// Parses an X25519 recipient (`age1...`) from its string form.
pub fn parse_recipient(s: &str) -> Result<Recipient, ZrbError> {
    Recipient::from_str(s).map_err(|e| ZrbError::InvalidRecipient(s.to_string(), e.to_string()))
}

/// Reads an X25519 identity (`AGE-SECRET-KEY-1...`) from a key file,
/// skipping comments and blank lines.
pub fn load_identity(path: &Path) -> Result<Identity, ZrbError> {
    let file = BufReader::new(File::open(path)?);

    for line in file.lines() {
        let line = line?;
        let line = line.trim();

        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        return Identity::from_str(line)
            .map_err(|e| ZrbError::InvalidIdentity(path.to_path_buf(), e.to_string()));
    }

    Err(ZrbError::InvalidIdentity(
        path.to_path_buf(),
        "no secret key line found".to_string(),
    ))
}

/// Generates a fresh X25519 key pair.
/// Returns the secret identity and the public recipient in string form.
pub fn generate_keypair() -> (String, String) {
    let identity = Identity::generate();
    let recipient = identity.to_public();

    (
        identity.to_string().expose_secret().to_string(),
        recipient.to_string(),
    )
}

/// Writes an identity file in the `age-keygen` format,
/// restricting access to the owning user.
pub fn write_identity_file(path: &Path, identity: &str, recipient: &str) -> Result<(), ZrbError> {
    let mut f = OpenOptions::new()
        .create_new(true)
        .write(true)
        .mode(0o600)
        .open(path)?;

    writeln!(f, "# created: {}", Utc::now().to_rfc3339())?;
    writeln!(f, "# public key: {}", recipient)?;
    writeln!(f, "{}", identity)?;

    Ok(())
}

/// Encrypts the plaintext reader to the writer
/// using the streaming age envelope for the given recipient.
pub fn encrypt<R: Read, W: Write>(
    mut reader: R,
    writer: W,
    recipient: &Recipient,
) -> Result<(), ZrbError> {
    let encryptor = age::Encryptor::with_recipients(vec![Box::new(recipient.clone())])
        .expect("a recipient is always supplied");

    let mut output = encryptor.wrap_output(writer)?;
    io::copy(&mut reader, &mut output)?;
    output.finish()?.flush()?;

    Ok(())
}

/// Decrypts the age ciphertext reader to the writer using the given identity.
pub fn decrypt<R: Read, W: Write>(
    reader: R,
    mut writer: W,
    identity: &Identity,
) -> Result<(), ZrbError> {
    let decryptor = match age::Decryptor::new(reader)? {
        age::Decryptor::Recipients(decryptor) => decryptor,
        age::Decryptor::Passphrase(_) => return Err(ZrbError::PassphraseCiphertext),
    };

    let mut input = decryptor.decrypt(iter::once(identity as &dyn age::Identity))?;
    io::copy(&mut input, &mut writer)?;
    writer.flush()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Cursor;

    #[test]
    fn keypair_round_trip() {
        let (identity_str, recipient_str) = generate_keypair();

        let dir = tempfile::tempdir().unwrap();
        let key_path = dir.path().join("identity.key");
        write_identity_file(&key_path, &identity_str, &recipient_str).unwrap();

        let recipient = parse_recipient(&recipient_str).unwrap();
        let identity = load_identity(&key_path).unwrap();

        let plaintext = b"ZFS Remote Backup - Key Pair Test - 2024-01-15T10:30:00Z";

        let mut ciphertext = Vec::new();
        encrypt(Cursor::new(&plaintext[..]), &mut ciphertext, &recipient).unwrap();
        assert_ne!(ciphertext, plaintext);

        let mut decrypted = Vec::new();
        decrypt(Cursor::new(&ciphertext), &mut decrypted, &identity).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn decrypt_with_wrong_identity_fails() {
        let (_, recipient_str) = generate_keypair();
        let recipient = parse_recipient(&recipient_str).unwrap();

        let mut ciphertext = Vec::new();
        encrypt(Cursor::new(b"secret" as &[u8]), &mut ciphertext, &recipient).unwrap();

        let other = Identity::generate();
        let mut decrypted = Vec::new();
        let result = decrypt(Cursor::new(&ciphertext), &mut decrypted, &other);

        assert!(matches!(result, Err(ZrbError::Decrypt(_))));
    }

    #[test]
    fn garbage_ciphertext_fails_to_parse() {
        let identity = Identity::generate();
        let mut decrypted = Vec::new();
        let result = decrypt(
            Cursor::new(b"not an age file at all" as &[u8]),
            &mut decrypted,
            &identity,
        );

        assert!(matches!(result, Err(ZrbError::Decrypt(_))));
    }

    #[test]
    fn invalid_recipient_is_rejected() {
        assert!(matches!(
            parse_recipient("age1notakey"),
            Err(ZrbError::InvalidRecipient(_, _))
        ));
    }

    #[test]
    fn identity_file_without_key_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let key_path = dir.path().join("empty.key");
        std::fs::write(&key_path, "# created: today\n\n").unwrap();

        assert!(matches!(
            load_identity(&key_path),
            Err(ZrbError::InvalidIdentity(_, _))
        ));
    }
}
