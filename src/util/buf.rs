use anyhow::anyhow;
use bytes::{Buf, BufMut, Bytes};
use bytes_varint::{VarIntSupport, VarIntSupportMut};
use serde_json::Value;



pub fn put_string(buf: &mut impl BufMut, s: &str) {
    buf.put_usize_varint(s.len());
    buf.put_slice(s.as_bytes());
}

pub fn try_get_string(buf: &mut impl Buf) -> anyhow::Result<String> {
    let len = try_get_len(buf)?;
    let bytes = try_get_bytes(buf, len)?;

    let s = String::from_utf8(bytes.to_vec())?;
    Ok(s)
}

pub fn put_opt_string(buf: &mut impl BufMut, s: Option<&str>) {
    match s {
        Some(s) => {
            buf.put_u8(1);
            put_string(buf, s);
        }
        None => buf.put_u8(0),
    }
}

pub fn try_get_opt_string(buf: &mut impl Buf) -> anyhow::Result<Option<String>> {
    if try_get_presence_flag(buf)? {
        Ok(Some(try_get_string(buf)?))
    }
    else {
        Ok(None)
    }
}

pub fn put_opt_u64(buf: &mut impl BufMut, value: Option<u64>) {
    match value {
        Some(value) => {
            buf.put_u8(1);
            buf.put_u64(value);
        }
        None => buf.put_u8(0),
    }
}

pub fn try_get_opt_u64(buf: &mut impl Buf) -> anyhow::Result<Option<u64>> {
    if try_get_presence_flag(buf)? {
        Ok(Some(buf.try_get_u64()?))
    }
    else {
        Ok(None)
    }
}

/// Payload documents go on the wire as their JSON text, prefixed with the text's length
pub fn put_payload(buf: &mut impl BufMut, value: &Value) {
    let json = serde_json::to_vec(value)
        .expect("serializing a JSON value to memory is infallible");
    buf.put_usize_varint(json.len());
    buf.put_slice(&json);
}

pub fn try_get_payload(buf: &mut impl Buf) -> anyhow::Result<Value> {
    let len = try_get_len(buf)?;
    let bytes = try_get_bytes(buf, len)?;
    Ok(serde_json::from_slice(&bytes)?)
}

pub fn put_opt_payload(buf: &mut impl BufMut, value: Option<&Value>) {
    match value {
        Some(value) => {
            buf.put_u8(1);
            put_payload(buf, value);
        }
        None => buf.put_u8(0),
    }
}

pub fn try_get_opt_payload(buf: &mut impl Buf) -> anyhow::Result<Option<Value>> {
    if try_get_presence_flag(buf)? {
        Ok(Some(try_get_payload(buf)?))
    }
    else {
        Ok(None)
    }
}

pub fn try_get_bool(buf: &mut impl Buf) -> anyhow::Result<bool> {
    match buf.try_get_u8()? {
        0 => Ok(false),
        1 => Ok(true),
        n => Err(anyhow!("invalid boolean discriminator: {}", n)),
    }
}

fn try_get_presence_flag(buf: &mut impl Buf) -> anyhow::Result<bool> {
    match buf.try_get_u8()? {
        0 => Ok(false),
        1 => Ok(true),
        n => Err(anyhow!("invalid presence flag: {}", n)),
    }
}

fn try_get_len(buf: &mut impl Buf) -> anyhow::Result<usize> {
    buf.try_get_usize_varint()
        .map_err(|e| anyhow!("VarInt error: {:?}", e))
}

fn try_get_bytes(buf: &mut impl Buf, len: usize) -> anyhow::Result<Bytes> {
    if buf.remaining() < len {
        return Err(anyhow!("buffer underflow: expected {} bytes, {} remaining", len, buf.remaining()));
    }
    Ok(buf.copy_to_bytes(len))
}

#[cfg(test)]
mod test {
    use bytes::BytesMut;
    use rstest::rstest;
    use serde_json::json;

    use super::*;

    #[rstest]
    #[case::empty("", b"\0")]
    #[case::ascii("abc", b"\x03abc")]
    #[case::utf8("ä", b"\x02\xc3\xa4")]
    fn test_put_string(#[case] s: &str, #[case] expected: &[u8]) {
        let mut buf = BytesMut::new();
        put_string(&mut buf, s);
        assert_eq!(&buf, expected);

        let mut read_buf: &[u8] = &buf;
        assert_eq!(try_get_string(&mut read_buf).unwrap(), s);
        assert!(read_buf.is_empty());
    }

    #[rstest]
    #[case::truncated(b"\x05ab")]
    #[case::invalid_utf8(b"\x01\xff")]
    #[case::no_len(b"")]
    fn test_try_get_string_invalid(#[case] mut buf: &[u8]) {
        assert!(try_get_string(&mut buf).is_err());
    }

    #[rstest]
    #[case::absent(None, b"\0")]
    #[case::present(Some(7), b"\x01\0\0\0\0\0\0\0\x07")]
    fn test_opt_u64(#[case] value: Option<u64>, #[case] expected: &[u8]) {
        let mut buf = BytesMut::new();
        put_opt_u64(&mut buf, value);
        assert_eq!(&buf, expected);

        let mut read_buf: &[u8] = &buf;
        assert_eq!(try_get_opt_u64(&mut read_buf).unwrap(), value);
    }

    #[test]
    fn test_invalid_presence_flag() {
        let mut buf: &[u8] = b"\x02abc";
        assert!(try_get_opt_string(&mut buf).is_err());
    }

    #[test]
    fn test_payload_is_length_prefixed_json() {
        let mut buf = BytesMut::new();
        put_payload(&mut buf, &json!({"a": 1}));
        assert_eq!(&buf, b"\x07{\"a\":1}".as_slice());
    }

    #[rstest]
    #[case::bool_false(b"\0", Some(false))]
    #[case::bool_true(b"\x01", Some(true))]
    #[case::bool_invalid(b"\x02", None)]
    fn test_try_get_bool(#[case] mut buf: &[u8], #[case] expected: Option<bool>) {
        assert_eq!(try_get_bool(&mut buf).ok(), expected);
    }
}
