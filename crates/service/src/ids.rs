use rand::Rng;

/// Human shareable link identifiers are 8 lowercase alphanumerics.
pub const LINK_ID_LEN: usize = 8;

const LINK_ID_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// generate a link identifier.
///
/// Uniqueness is not guaranteed here; the registry rejects a collision and
/// the caller retries with a fresh sample.
///
/// # Unit Test
///
/// ```
/// use openlink_server_service::ids::*;
///
/// let id = link_id();
///
/// assert_eq!(id.len(), LINK_ID_LEN);
/// assert!(is_link_id(&id));
/// ```
pub fn link_id() -> String {
    let mut rng = rand::rng();
    (0..LINK_ID_LEN)
        .map(|_| LINK_ID_ALPHABET[rng.random_range(0..LINK_ID_ALPHABET.len())] as char)
        .collect()
}

/// generate a lowercase hex identifier from `bytes` random bytes.
///
/// # Unit Test
///
/// ```
/// use openlink_server_service::ids::*;
///
/// assert_eq!(hex_id(16).len(), 32);
/// assert_eq!(hex_id(8).len(), 16);
/// ```
pub fn hex_id(bytes: usize) -> String {
    let mut rng = rand::rng();
    (0..bytes)
        .map(|_| format!("{:02x}", rng.random_range(0..=u8::MAX)))
        .collect()
}

/// connection identifiers are 128 random bits in hex.
pub fn connection_id() -> String {
    hex_id(16)
}

/// # Unit Test
///
/// ```
/// use openlink_server_service::ids::*;
///
/// assert!(is_link_id("abcd1234"));
/// assert!(!is_link_id("ABCD1234"));
/// assert!(!is_link_id("abcd123"));
/// assert!(!is_link_id("abcd12345"));
/// ```
pub fn is_link_id(value: &str) -> bool {
    value.len() == LINK_ID_LEN
        && value
            .bytes()
            .all(|it| it.is_ascii_lowercase() || it.is_ascii_digit())
}

fn is_hex_id(value: &str, len: usize) -> bool {
    value.len() == len
        && value
            .bytes()
            .all(|it| it.is_ascii_digit() || (b'a'..=b'f').contains(&it))
}

/// Both identifier forms are accepted as a session key: the shareable link
/// form and the 32 hex form produced from a 128 bit random source.
///
/// # Unit Test
///
/// ```
/// use openlink_server_service::ids::*;
///
/// assert!(is_session_id("abcd1234"));
/// assert!(is_session_id(&hex_id(16)));
/// assert!(!is_session_id("not a session id"));
/// ```
pub fn is_session_id(value: &str) -> bool {
    is_link_id(value) || is_hex_id(value, 32)
}
