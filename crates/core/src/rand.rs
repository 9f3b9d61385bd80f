use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use rand_core::{OsRng, RngCore};

/// İşletim sistemi RNG'sinden `bytes` bayt okuyup padding'siz base64url ile
/// kodlar.
///
/// Challenge token'ları ve kayıt kimlikleri gibi URL içinde taşınan opak
/// değerler bu yardımcı ile üretilir.
#[must_use]
pub fn url_safe_token(bytes: usize) -> String {
    let mut buf = vec![0_u8; bytes];
    OsRng.fill_bytes(&mut buf);
    URL_SAFE_NO_PAD.encode(&buf)
}
