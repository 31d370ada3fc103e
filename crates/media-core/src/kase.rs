//! KASE channel binding.
//!
//! The binding of two clients is the XOR of the SipHash-2-4 digests of
//! their ids under an all-zero key, which makes it symmetric in the two
//! ids.

use std::hash::Hasher;

use siphasher::sip::SipHasher24;

use crate::error::{MediaError, Result};

/// Size of the channel-binding value in bytes.
pub const CHANNEL_BINDING_SIZE: usize = 8;

fn shorthash(input: &str) -> [u8; CHANNEL_BINDING_SIZE] {
    let mut hasher = SipHasher24::new_with_keys(0, 0);
    hasher.write(input.as_bytes());
    hasher.finish().to_le_bytes()
}

/// Compute the channel binding of two client ids.
pub fn channel_binding(
    client_local: &str,
    client_remote: &str,
) -> Result<[u8; CHANNEL_BINDING_SIZE]> {
    if client_local.is_empty() {
        return Err(MediaError::InvalidArgument("local client id"));
    }
    if client_remote.is_empty() {
        return Err(MediaError::InvalidArgument("remote client id"));
    }

    let h1 = shorthash(client_local);
    let h2 = shorthash(client_remote);

    let mut binding = [0u8; CHANNEL_BINDING_SIZE];
    for (out, (a, b)) in binding.iter_mut().zip(h1.iter().zip(h2.iter())) {
        *out = a ^ b;
    }
    Ok(binding)
}
