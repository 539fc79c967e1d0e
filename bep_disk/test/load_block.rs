use crate::InMemoryFileSystem;
use bep_disk::{DiskManagerBuilder, IDiskMessage, ODiskMessage};
use futures::sink::Sink;
use futures::stream::Stream;
use tokio_core::reactor::Core;

#[test]
fn positive_load_block_after_process() {
    let layout = crate::simple_layout(11, 16384, 16384 * 2);
    let hash = *layout.info_hash();
    let data = crate::random_buffer(16384);

    let filesystem = InMemoryFileSystem::new();
    let disk_manager = DiskManagerBuilder::new().build(filesystem);

    let (send, recv) = disk_manager.split();
    let mut blocking_send = send.wait();
    blocking_send.send(IDiskMessage::AddTorrent(layout)).unwrap();

    let mut core = Core::new().unwrap();
    let (msg, recv) = crate::next_message(&mut core, recv, 2000);
    match msg {
        ODiskMessage::TorrentAdded(_) => {}
        unexpected => panic!("Unexpected Message: {:?}", unexpected),
    }

    crate::send_block(&mut blocking_send, &data, hash, 0, 0);
    let (msg, recv) = crate::next_message(&mut core, recv, 2000);
    match msg {
        ODiskMessage::BlockProcessed(_) => {}
        unexpected => panic!("Unexpected Message: {:?}", unexpected),
    }

    crate::send_load(&mut blocking_send, hash, 0, 0, 16384);
    let (msg, _recv) = crate::next_message(&mut core, recv, 2000);
    match msg {
        ODiskMessage::BlockLoaded(block) => assert_eq!(&*block, &data[..]),
        unexpected => panic!("Unexpected Message: {:?}", unexpected),
    }
}

#[test]
fn positive_load_block_uncached() {
    // A zero block cache forces both paths to fall open to direct I/O.
    let layout = crate::simple_layout(12, 16384, 16384 * 4);
    let hash = *layout.info_hash();
    let data = crate::random_buffer(16384);

    let filesystem = InMemoryFileSystem::new();
    let disk_manager = DiskManagerBuilder::new().with_cache_size(0).build(filesystem);

    let (send, recv) = disk_manager.split();
    let mut blocking_send = send.wait();
    blocking_send.send(IDiskMessage::AddTorrent(layout)).unwrap();

    let mut core = Core::new().unwrap();
    let (msg, recv) = crate::next_message(&mut core, recv, 2000);
    match msg {
        ODiskMessage::TorrentAdded(_) => {}
        unexpected => panic!("Unexpected Message: {:?}", unexpected),
    }

    crate::send_block(&mut blocking_send, &data, hash, 2, 0);
    let (msg, recv) = crate::next_message(&mut core, recv, 2000);
    match msg {
        ODiskMessage::BlockProcessed(_) => {}
        unexpected => panic!("Unexpected Message: {:?}", unexpected),
    }

    crate::send_load(&mut blocking_send, hash, 2, 0, 16384);
    let (msg, _recv) = crate::next_message(&mut core, recv, 2000);
    match msg {
        ODiskMessage::BlockLoaded(block) => assert_eq!(&*block, &data[..]),
        unexpected => panic!("Unexpected Message: {:?}", unexpected),
    }
}
