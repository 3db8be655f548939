use rand::{thread_rng, Rng};
use sha2::{Digest, Sha256};

/// The number of hex characters kept from a user's digest when deriving their pod id.
pub const POD_ID_LEN: usize = 10;

/// pod_id derives a short, stable, lowercase hexadecimal identifier for a user.
///
/// The same user always maps to the same id, which is what allows a user's rendered
/// overlay directory and instance label to be found again without any stored state.
/// The result is a valid RFC 1035 label suffix (it may begin with a digit, so it
/// MUST NOT be used as a label on its own).
///
/// The digest is SHA-256. Brokers that derived ids from SHA-1 label pods differently, so
/// reservations they made are not recognised after switching over.
pub fn pod_id<T: AsRef<str>>(user: T) -> String {
    let mut id = hex_digest(user.as_ref());
    id.truncate(POD_ID_LEN);
    id
}

/// instance_id is the value of the per-user instance label, `{app}-{pod_id}`.
pub fn instance_id<A: AsRef<str>, U: AsRef<str>>(app: A, user: U) -> String {
    format!("{}-{}", app.as_ref(), pod_id(user))
}

/// session_key returns a fresh, human friendly, key of the form `abc-defg-hij`.
pub fn session_key() -> String {
    let mut rng = thread_rng();
    [3, 4, 3]
        .iter()
        .map(|len| {
            (0..*len)
                .map(|_| rng.gen_range('a'..='z'))
                .collect::<String>()
        })
        .collect::<Vec<String>>()
        .join("-")
}

/// random_secret returns forty random lowercase hexadecimal characters.
pub fn random_secret() -> String {
    let bytes: [u8; 20] = thread_rng().gen();
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Lowercase hex encoded SHA-256 of the input.
pub fn hex_digest<T: AsRef<[u8]>>(input: T) -> String {
    format!("{:x}", Sha256::digest(input.as_ref()))
}
