use crate::error::SessionError;
use comet_core::{ComposedMessage, MailAddress};
use url::Url;

/// Builds a draft from a `mailto:` URL or a bare address.
///
/// Recognised query fields are `to`, `cc`, `bcc`, `subject` and `body`;
/// others are ignored.
pub fn parse_mailto(input: &str) -> Result<ComposedMessage, SessionError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(SessionError::InvalidMailto("empty address".to_string()));
    }

    if !input.to_ascii_lowercase().starts_with("mailto:") {
        return Ok(ComposedMessage {
            to: addresses(input)?,
            ..ComposedMessage::default()
        });
    }

    let url = Url::parse(input).map_err(|err| SessionError::InvalidMailto(err.to_string()))?;
    let mut draft = ComposedMessage::default();
    let path = urlencoding::decode(url.path())
        .map_err(|err| SessionError::InvalidMailto(err.to_string()))?;
    if !path.is_empty() {
        draft.to = addresses(&path)?;
    }

    for (key, value) in url.query_pairs() {
        match key.to_ascii_lowercase().as_str() {
            "to" => draft.to.extend(addresses(&value)?),
            "cc" => draft.cc.extend(addresses(&value)?),
            "bcc" => draft.bcc.extend(addresses(&value)?),
            "subject" => draft.subject = value.into_owned(),
            "body" => draft.body = value.into_owned(),
            other => tracing::debug!(field = other, "ignoring mailto field"),
        }
    }

    if draft.to.is_empty() && draft.cc.is_empty() && draft.bcc.is_empty() {
        return Err(SessionError::InvalidMailto(format!("no recipients in {input}")));
    }
    Ok(draft)
}

fn addresses(list: &str) -> Result<Vec<MailAddress>, SessionError> {
    list.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            if part.contains('@') {
                Ok(MailAddress::new(part))
            } else {
                Err(SessionError::InvalidMailto(format!("not an address: {part}")))
            }
        })
        .collect()
}
