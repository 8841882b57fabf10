//! Response body helpers shared by every handler

use futures::TryStreamExt;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full, StreamBody};
use hyper::body::{Body, Bytes, Frame};
use tokio_util::io::ReaderStream;

/// Read size for streamed files
const FILE_CHUNK_SIZE: usize = 64 * 1024;

/// Error type carried by response bodies
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Body type of every response the gateway produces
pub type GatewayBody = BoxBody<Bytes, BoxError>;

pub fn full(data: impl Into<Bytes>) -> GatewayBody {
    Full::new(data.into()).map_err(|never| match never {}).boxed()
}

pub fn empty() -> GatewayBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

/// Stream an open file in fixed-size frames
pub fn file(file: tokio::fs::File) -> GatewayBody {
    let frames = ReaderStream::with_capacity(file, FILE_CHUNK_SIZE)
        .map_ok(Frame::data)
        .map_err(BoxError::from);
    StreamBody::new(frames).boxed()
}

/// Box any body whose error converts into [`BoxError`]
pub fn boxed<B>(body: B) -> GatewayBody
where
    B: Body<Data = Bytes> + Send + Sync + 'static,
    B::Error: Into<BoxError>,
{
    body.map_err(Into::into).boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn test_file_body_streams_in_chunks() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        let data = vec![b'x'; FILE_CHUNK_SIZE * 2 + 10];
        tmp.write_all(&data).unwrap();

        let mut body = file(tokio::fs::File::open(tmp.path()).await.unwrap());
        let mut frames = 0;
        let mut total = 0;
        while let Some(frame) = body.frame().await {
            let chunk = frame.unwrap().into_data().unwrap();
            assert!(chunk.len() <= FILE_CHUNK_SIZE);
            frames += 1;
            total += chunk.len();
        }
        assert!(frames >= 3);
        assert_eq!(total, data.len());
    }
}
