use std::io::{Read, Write};

use bytes::{Buf, Bytes};
use flate2::Compression;
use flate2::read::{MultiGzDecoder, ZlibDecoder};
use flate2::write::GzEncoder;
use http::StatusCode;
use http_body_util::combinators::BoxBody;

/// decode decodes a HTTP request body based on its Content-Encoding header.
/// Only identity, gzip, and deflate are currently supported content encodings.
///
/// It supports multiple content encodings joined by ,s. They are decoded in the
/// order provided.
///
/// See [RFC7231](https://httpwg.org/specs/rfc7231.html#header.content-encoding) for more details
/// on this header value.
///
/// # Errors
///
/// Will return an `Err` including a `hyper` response body if:
///
/// * The passed `content_encoding` is unknown
/// * The body cannot be decoded as the specified content type
///
/// This response body can be passed back as the HTTP response to the client
pub(crate) fn decode(
    content_encoding: Option<&hyper::header::HeaderValue>,
    mut body: Bytes,
) -> Result<Bytes, Box<hyper::Response<BoxBody<Bytes, hyper::Error>>>> {
    if let Some(content_encoding) = content_encoding {
        let content_encoding = String::from_utf8_lossy(content_encoding.as_bytes());

        for encoding in content_encoding
            .rsplit(',')
            .map(str::trim)
            .map(str::to_lowercase)
        {
            body = match encoding.as_ref() {
                "identity" => body,
                "gzip" => {
                    let mut decoded = Vec::new();
                    MultiGzDecoder::new(body.reader())
                        .read_to_end(&mut decoded)
                        .map_err(|error| encoding_error_to_response(&encoding, error))?;
                    decoded.into()
                }
                "deflate" => {
                    let mut decoded = Vec::new();
                    ZlibDecoder::new(body.reader())
                        .read_to_end(&mut decoded)
                        .map_err(|error| encoding_error_to_response(&encoding, error))?;
                    decoded.into()
                }
                encoding => {
                    return Err(Box::new(
                        hyper::Response::builder()
                            .status(StatusCode::UNSUPPORTED_MEDIA_TYPE)
                            .body(crate::full(format!(
                                "Unsupported encoding type: {encoding}"
                            )))
                            .expect("failed to build response"),
                    ));
                }
            }
        }
    }

    Ok(body)
}

fn encoding_error_to_response(
    encoding: &str,
    error: impl std::error::Error,
) -> Box<hyper::Response<BoxBody<Bytes, hyper::Error>>> {
    Box::new(
        hyper::Response::builder()
            .status(StatusCode::UNSUPPORTED_MEDIA_TYPE)
            .body(crate::full(format!(
                "failed to decode input as {encoding}: {error}"
            )))
            .expect("failed to build response"),
    )
}

/// Compress `body` with gzip at the default level.
pub(crate) fn gzip(body: &[u8]) -> Result<Vec<u8>, std::io::Error> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(body)?;
    encoder.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    #[test]
    fn identity_and_absent_pass_through() {
        let body = Bytes::from_static(b"plain");
        let out = decode(None, body.clone()).expect("absent encoding");
        assert_eq!(out, body);

        let header = HeaderValue::from_static("identity");
        let out = decode(Some(&header), body.clone()).expect("identity encoding");
        assert_eq!(out, body);
    }

    #[test]
    fn gzip_round_trip() {
        let plain = br#"{"id":"Alloc","type":"gauge","value":1.0}"#;
        let compressed = gzip(plain).expect("gzip");
        let header = HeaderValue::from_static("gzip");
        let out = decode(Some(&header), compressed.into()).expect("gzip decode");
        assert_eq!(out.as_ref(), plain);
    }

    #[test]
    fn unknown_encoding_rejected() {
        let header = HeaderValue::from_static("br");
        let result = decode(Some(&header), Bytes::from_static(b"x"));
        let response = result.expect_err("unknown encoding must be rejected");
        assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
    }

    #[test]
    fn corrupt_gzip_rejected() {
        let header = HeaderValue::from_static("gzip");
        let result = decode(Some(&header), Bytes::from_static(b"not gzip at all"));
        let response = result.expect_err("corrupt body must be rejected");
        assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
    }
}
