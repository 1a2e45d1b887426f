//! Key layout: a single prefix byte identifying the entity kind, followed by
//! the entity's identity (digest, folder id or allocated sequence number).

use spindrift_types::DeviceId;

/// Miscellaneous values, e.g. the schema version.
pub const MISC: u8 = 0;
/// Device records keyed by digest.
pub const DEVICE: u8 = 1;
/// Folder records keyed by folder id.
pub const FOLDER: u8 = 2;
/// Folder-info records keyed by allocated sequence.
pub const FOLDER_INFO: u8 = 3;
/// File-info records keyed by allocated sequence.
pub const FILE_INFO: u8 = 4;
/// Block records keyed by hash.
pub const BLOCK_INFO: u8 = 5;
/// Ignored-device records keyed by digest.
pub const IGNORED_DEVICE: u8 = 6;
/// Ignored-folder records keyed by folder id.
pub const IGNORED_FOLDER: u8 = 7;
/// Unknown-folder records keyed by folder id + digest.
pub const UNKNOWN_FOLDER: u8 = 8;

/// Key under the misc prefix.
pub fn misc(name: &str) -> Vec<u8> {
    prefixed(MISC, name.as_bytes())
}

/// Key for a device record.
pub fn device(id: &DeviceId) -> Vec<u8> {
    prefixed(DEVICE, id.as_bytes())
}

/// Key for a folder record.
pub fn folder(id: &str) -> Vec<u8> {
    prefixed(FOLDER, id.as_bytes())
}

/// Key for a folder-info record.
pub fn folder_info(seq: u64) -> Vec<u8> {
    prefixed(FOLDER_INFO, &seq.to_be_bytes())
}

/// Key for a file-info record.
pub fn file_info(seq: u64) -> Vec<u8> {
    prefixed(FILE_INFO, &seq.to_be_bytes())
}

/// Key for a block record.
pub fn block(hash: &[u8; 32]) -> Vec<u8> {
    prefixed(BLOCK_INFO, hash)
}

/// Key for an ignored-device record.
pub fn ignored_device(id: &DeviceId) -> Vec<u8> {
    prefixed(IGNORED_DEVICE, id.as_bytes())
}

/// Key for an ignored-folder record.
pub fn ignored_folder(id: &str) -> Vec<u8> {
    prefixed(IGNORED_FOLDER, id.as_bytes())
}

/// Key for an unknown-folder record.
pub fn unknown_folder(id: &str, device: &DeviceId) -> Vec<u8> {
    let mut body = id.as_bytes().to_vec();
    body.extend_from_slice(device.as_bytes());
    prefixed(UNKNOWN_FOLDER, &body)
}

fn prefixed(prefix: u8, body: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + body.len());
    key.push(prefix);
    key.extend_from_slice(body);
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_carry_their_prefix_byte() {
        let id = DeviceId::from_sha256([3; 32]);
        assert_eq!(device(&id)[0], DEVICE);
        assert_eq!(device(&id).len(), 33);
        assert_eq!(folder("abc"), vec![FOLDER, b'a', b'b', b'c']);
        assert_eq!(block(&[9; 32])[0], BLOCK_INFO);
        assert_eq!(misc("db_version")[0], MISC);
    }

    #[test]
    fn sequence_keys_sort_by_value() {
        assert!(folder_info(1) < folder_info(2));
        assert!(folder_info(255) < folder_info(256));
    }

    #[test]
    fn prefixes_partition_the_keyspace() {
        let id = DeviceId::from_sha256([1; 32]);
        let keys = [
            misc("x"),
            device(&id),
            folder("x"),
            folder_info(1),
            file_info(1),
            block(&[1; 32]),
            ignored_device(&id),
            ignored_folder("x"),
            unknown_folder("x", &id),
        ];
        for (i, key) in keys.iter().enumerate() {
            assert_eq!(key[0] as usize, i);
        }
    }
}
