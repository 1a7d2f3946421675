use aliri_braid::braid;
use std::fmt;

macro_rules! redacted {
    ($ty:ty: $label:literal, $reveal:literal) => {
        impl fmt::Debug for $ty {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                if f.alternate() {
                    f.write_str("\"")?;
                    reveal_prefix(&self.0, &mut *f, $reveal)?;
                    f.write_str("\"")
                } else {
                    f.write_str(concat!("***", $label, "***"))
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                if f.alternate() {
                    reveal_prefix(&self.0, &mut *f, usize::MAX)
                } else {
                    f.write_str(concat!("***", $label, "***"))
                }
            }
        }
    };
}

/// Writes at most `width` characters of a secret, marking truncation with an ellipsis
///
/// The formatter's width, when given, takes precedence over `default_width`.
fn reveal_prefix(secret: &str, f: &mut fmt::Formatter, default_width: usize) -> fmt::Result {
    let width = f.width().unwrap_or(default_width);
    if width <= 1 {
        return f.write_str("…");
    }

    if secret.char_indices().nth(width).is_none() {
        return f.write_str(secret);
    }

    let cut = secret
        .char_indices()
        .nth(width - 1)
        .map_or(secret.len(), |(idx, _)| idx);
    f.write_str(&secret[..cut])?;
    f.write_str("…")
}

/// A bearer access token attached to outgoing requests
#[braid(serde, debug = "owned", display = "owned")]
pub struct AccessToken;

redacted!(AccessTokenRef: "ACCESS TOKEN", 15);

/// A long-lived token used only to mint new access tokens
#[braid(serde, debug = "owned", display = "owned")]
pub struct RefreshToken;

redacted!(RefreshTokenRef: "REFRESH TOKEN", 5);
