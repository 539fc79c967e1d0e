use crate::InMemoryFileSystem;
use bep_disk::{DiskManagerBuilder, IDiskMessage, ODiskMessage};
use futures::sink::Sink;
use futures::stream::Stream;
use tokio_core::reactor::Core;

#[test]
fn positive_process_block() {
    let layout = crate::simple_layout(10, 16384, 16384 * 2);
    let hash = *layout.info_hash();
    let data = crate::random_buffer(16384);

    let filesystem = InMemoryFileSystem::new();
    let check_files = filesystem.clone();
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

    crate::send_block(&mut blocking_send, &data, hash, 1, 0);

    let (msg, _recv) = crate::next_message(&mut core, recv, 2000);
    match msg {
        ODiskMessage::BlockProcessed(block) => assert_eq!(1, block.metadata().piece_index()),
        unexpected => panic!("Unexpected Message: {:?}", unexpected),
    }

    // The flushed block landed at piece offset one within the file.
    check_files.with_files(|files| {
        let file = files.values().next().unwrap();
        assert_eq!(&file[16384..32768], &data[..]);
    });
}

#[test]
fn positive_process_block_without_torrent_errors() {
    let filesystem = InMemoryFileSystem::new();
    let disk_manager = DiskManagerBuilder::new().build(filesystem);

    let (send, recv) = disk_manager.split();
    let mut blocking_send = send.wait();

    let data = crate::random_buffer(16384);
    crate::send_block(&mut blocking_send, &data, [99u8; 20].into(), 0, 0);

    let mut core = Core::new().unwrap();
    let (msg, _recv) = crate::next_message(&mut core, recv, 500);
    match msg {
        ODiskMessage::ProcessBlockError(..) => {}
        unexpected => panic!("Unexpected Message: {:?}", unexpected),
    }
}
