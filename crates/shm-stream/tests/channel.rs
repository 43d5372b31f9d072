use std::future::Future;
use std::pin::Pin;
use std::sync::mpsc;
use std::task::{Context, Poll};
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use futures_util::task::noop_waker;
use pollster::block_on;
use shm_stream::rendezvous::{Consumed, ReaderSide};
use shm_stream::{
    channel, ChannelConfig, Result, ShmError, ShmReader, ShmRegion, ShmWriter, WordState,
};

fn chunks(items: &[&'static str]) -> Vec<Bytes> {
    items.iter().map(|s| Bytes::from_static(s.as_bytes())).collect()
}

/// Run `produce` on its own thread and collect everything the reader yields.
fn pump<F>(config: ChannelConfig, produce: F) -> Vec<Bytes>
where
    F: FnOnce(ShmWriter) -> Result<()> + Send + 'static,
{
    let (writer, reader) = channel(&config).unwrap();
    let producer = thread::spawn(move || produce(writer));
    let got = reader.collect::<Result<Vec<_>>>().unwrap();
    producer.join().unwrap().unwrap();
    got
}

#[test]
fn single_write_then_end() {
    let got = pump(ChannelConfig::default(), |writer| {
        block_on(writer.write("hello"))?;
        block_on(writer.end())
    });
    assert_eq!(got, chunks(&["hello"]));
}

#[test]
fn uncorked_write_publishes_without_being_polled() {
    let (writer, mut reader) = channel(&ChannelConfig::default()).unwrap();
    let waker = noop_waker();
    let mut cx = Context::from_waker(&waker);
    assert!(reader.poll_read(&mut cx).is_pending());

    let _pending = writer.write("eager");
    assert_eq!(reader.region().writer_word().load(), WordState::Signaled);
    assert!(matches!(reader.poll_read(&mut cx), Poll::Ready(Some(Ok(c))) if c == "eager"));
}

#[test]
fn unpolled_write_reaches_a_blocked_reader() {
    let (writer, mut reader) = channel(&ChannelConfig::default()).unwrap();
    let (tx, rx) = mpsc::channel();
    let consumer = thread::spawn(move || {
        tx.send(reader.read()).unwrap();
        reader
    });

    let _pending = writer.write("hello");
    let got = rx
        .recv_timeout(Duration::from_secs(5))
        .expect("chunk was never published");
    assert_eq!(got.unwrap().as_deref(), Some(&b"hello"[..]));

    drop(writer.end());
    let mut reader = consumer.join().unwrap();
    assert_eq!(reader.read(), Ok(None));
}

#[test]
fn corked_writes_travel_as_one_batch() {
    let region = ShmRegion::new(1024).unwrap();
    let writer = ShmWriter::new(region.clone()).unwrap();

    let producer = thread::spawn(move || -> Result<()> {
        writer.cork();
        let pending = [writer.write("A"), writer.write("B"), writer.write("C")];
        block_on(writer.uncork())?;
        for fut in pending {
            block_on(fut)?;
        }

        block_on(writer.write("D"))?;

        writer.cork();
        let ef = writer.writev(["E", "F"]);
        let g = writer.write("G");
        block_on(writer.uncork())?;
        block_on(ef)?;
        block_on(g)?;
        block_on(writer.end())
    });

    // Observe batch boundaries through the raw handshake.
    let side = ReaderSide::new(region);
    let mut batches: Vec<Vec<Bytes>> = Vec::new();
    side.request_read();
    loop {
        side.wait_batch().unwrap();
        let mut batch = Vec::new();
        match side
            .consume(|chunk| {
                batch.push(chunk);
                true
            })
            .unwrap()
        {
            Consumed::Batch { .. } => batches.push(batch),
            Consumed::End => break,
            Consumed::Nothing => {}
        }
    }
    producer.join().unwrap().unwrap();

    let flat: Vec<Bytes> = batches.iter().flatten().cloned().collect();
    assert_eq!(flat, chunks(&["A", "B", "C", "D", "E", "F", "G"]));
    assert_eq!(
        batches,
        vec![chunks(&["A", "B", "C"]), chunks(&["D"]), chunks(&["E", "F", "G"])]
    );
}

#[test]
fn nested_cork_waits_for_outer_uncork() {
    let (writer, mut reader) = channel(&ChannelConfig::default()).unwrap();
    let waker = noop_waker();
    let mut cx = Context::from_waker(&waker);

    writer.cork();
    writer.cork();
    let mut a = writer.write("a");
    let mut inner = writer.uncork();
    assert_eq!(writer.corked(), 1);

    // Give the writer demand; nothing may be published while still corked.
    assert!(reader.poll_read(&mut cx).is_pending());
    assert!(Pin::new(&mut a).poll(&mut cx).is_pending());
    assert!(Pin::new(&mut inner).poll(&mut cx).is_pending());
    assert_eq!(reader.region().writer_word().load(), WordState::Idle);

    let mut outer = writer.uncork();
    assert!(Pin::new(&mut outer).poll(&mut cx).is_pending());
    assert_eq!(reader.region().writer_word().load(), WordState::Signaled);
    assert!(matches!(reader.poll_read(&mut cx), Poll::Ready(Some(Ok(c))) if c == "a"));
    assert_eq!(block_on(outer), Ok(()));
    assert_eq!(block_on(a), Ok(()));
    assert_eq!(block_on(inner), Ok(()));
}

#[test]
fn flush_sync_between_writes_and_end() {
    let got = pump(ChannelConfig::default(), |writer| {
        let pending = [writer.write("one"), writer.write("two"), writer.write("three")];
        writer.flush_sync()?;
        assert_eq!(writer.buffered_bytes(), 0);
        for fut in pending {
            block_on(fut)?;
        }
        block_on(writer.end())
    });
    assert_eq!(got, chunks(&["one", "two", "three"]));
}

#[test]
fn flush_sync_alongside_a_pending_async_write() {
    let (writer, reader) = channel(&ChannelConfig::default()).unwrap();
    let producer = thread::spawn(move || -> Result<()> {
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        let mut pending = writer.write("x");
        // Polled once with a waker that goes nowhere.
        let _ = Pin::new(&mut pending).poll(&mut cx);
        writer.flush_sync()?;
        assert_eq!(block_on(pending), Ok(()));
        block_on(writer.end())
    });
    let got = reader.collect::<Result<Vec<_>>>().unwrap();
    producer.join().unwrap().unwrap();
    assert_eq!(got, chunks(&["x"]));
}

#[test]
fn writev_preserves_chunk_boundaries_including_empty_ones() {
    let got = pump(ChannelConfig::default(), |writer| {
        block_on(writer.writev([&b"ab"[..], b"", b"c"]))?;
        block_on(writer.writev(Vec::<Bytes>::new()))?;
        block_on(writer.end_with(Bytes::from_static(b"tail")))
    });
    assert_eq!(got, chunks(&["ab", "", "c", "tail"]));
}

#[test]
fn oversized_batch_fails_without_partial_delivery() {
    let config = ChannelConfig::default().with_byte_length(256);
    let (writer, reader) = channel(&config).unwrap();
    let producer = thread::spawn(move || {
        let res = block_on(writer.write(vec![7u8; 1000]));
        (res, writer.error(), block_on(writer.write("after")))
    });
    let got = reader.collect::<Result<Vec<_>>>().unwrap();
    let (res, stored, after) = producer.join().unwrap();

    assert!(got.is_empty());
    assert!(matches!(res, Err(ShmError::Capacity { needed: 1008, capacity: 128 })));
    assert_eq!(stored, res.err());
    assert_eq!(after, Err(ShmError::Closed));
}

#[test]
fn growable_region_fits_large_batches() {
    let config = ChannelConfig::default()
        .with_byte_length(256)
        .with_max_byte_length(4096);
    let (writer, reader) = channel(&config).unwrap();
    let region = reader.region().clone();

    let producer = thread::spawn(move || -> Result<()> {
        block_on(writer.write("small"))?;
        block_on(writer.write(vec![1u8; 1000]))?;
        block_on(writer.end())
    });
    let got = reader.collect::<Result<Vec<_>>>().unwrap();
    producer.join().unwrap().unwrap();

    assert_eq!(got.len(), 2);
    assert_eq!(got[1].len(), 1000);
    assert_eq!(region.byte_length(), 2048);
}

#[test]
fn write_after_end_is_rejected() {
    let (writer, _reader) = channel(&ChannelConfig::default()).unwrap();
    let ending = writer.end();
    assert!(writer.is_closed());
    assert_eq!(block_on(writer.write("late")), Err(ShmError::Closed));
    assert_eq!(block_on(ending), Ok(()));
    assert!(writer.is_ended());
    assert_eq!(block_on(writer.end()), Ok(()));
}

#[test]
fn destroy_fails_pending_writes_and_ends_reader() {
    let (writer, mut reader) = channel(&ChannelConfig::default()).unwrap();
    let pending = writer.write("dropped");
    writer.destroy(None);
    assert!(matches!(block_on(pending), Err(ShmError::Destroyed(_))));
    assert!(matches!(block_on(writer.end()), Err(ShmError::Destroyed(_))));
    assert_eq!(reader.read(), Ok(None));
}

#[test]
fn destroy_with_error_hands_it_to_pending_writes() {
    let (writer, _reader) = channel(&ChannelConfig::default()).unwrap();
    let pending = writer.write("dropped");
    writer.destroy(Some(ShmError::Io("disk gone".into())));
    assert_eq!(block_on(pending), Err(ShmError::Io("disk gone".into())));
    assert_eq!(writer.flush_sync(), Err(ShmError::Io("disk gone".into())));
}

#[test]
fn writer_reports_backpressure_at_high_water_mark() {
    let config = ChannelConfig::default().with_writer_high_water_mark(4);
    let (writer, _reader) = channel(&config).unwrap();
    drop(writer.write("ab"));
    assert!(!writer.needs_drain());
    drop(writer.write("cdef"));
    assert!(writer.needs_drain());
    assert_eq!(writer.buffered_bytes(), 6);
    writer.destroy(None);
    assert!(!writer.needs_drain());
}

#[test]
fn reader_high_water_mark_paces_the_writer() {
    let config = ChannelConfig::default().with_reader_high_water_mark(1);
    let expected: Vec<Bytes> = (0..50u8).map(|i| Bytes::from(vec![i; 3])).collect();
    let input = expected.clone();
    let got = pump(config, move |writer| {
        for chunk in input {
            block_on(writer.write(chunk))?;
        }
        block_on(writer.end())
    });
    assert_eq!(got, expected);
}

#[test]
fn async_reader_consumes_as_a_stream() {
    use futures_util::StreamExt;

    let (writer, mut reader) = channel(&ChannelConfig::default()).unwrap();
    let producer = thread::spawn(move || -> Result<()> {
        for word in ["alpha", "beta", "gamma"] {
            block_on(writer.write(word))?;
        }
        block_on(writer.end())
    });

    let got = block_on(async {
        let mut got = Vec::new();
        while let Some(chunk) = StreamExt::next(&mut reader).await {
            got.push(chunk.unwrap());
        }
        got
    });
    producer.join().unwrap().unwrap();
    assert_eq!(got, chunks(&["alpha", "beta", "gamma"]));
}

#[test]
fn second_attach_is_a_validation_error() {
    let region = ShmRegion::new(256).unwrap();
    let _reader = ShmReader::new(region.clone()).unwrap();
    assert!(matches!(
        ShmReader::new(region),
        Err(ShmError::Validation(_))
    ));
}
