use crate::InMemoryFileSystem;
use bep_disk::{DiskManagerBuilder, IDiskMessage, ODiskMessage};
use futures::sink::Sink;
use futures::stream::Stream;
use tokio_core::reactor::Core;

#[test]
fn positive_add_torrent() {
    let layout = crate::simple_layout(1, 16384, 16384 * 3);
    let hash = *layout.info_hash();

    let filesystem = InMemoryFileSystem::new();
    let check_files = filesystem.clone();
    let disk_manager = DiskManagerBuilder::new().build(filesystem);

    let (send, recv) = disk_manager.split();
    let mut blocking_send = send.wait();
    blocking_send.send(IDiskMessage::AddTorrent(layout)).unwrap();

    let mut core = Core::new().unwrap();
    let (msg, _recv) = crate::next_message(&mut core, recv, 500);
    match msg {
        ODiskMessage::TorrentAdded(recv_hash) => assert_eq!(hash, recv_hash),
        unexpected => panic!("Unexpected Message: {:?}", unexpected),
    }

    // Files were created and zero filled at their full sizes.
    check_files.with_files(|files| {
        assert_eq!(1, files.len());
        assert_eq!(16384 * 3, files.values().next().unwrap().len());
    });
}

#[test]
fn negative_add_torrent_twice() {
    let layout = crate::simple_layout(2, 16384, 16384);
    let duplicate = layout.clone();

    let filesystem = InMemoryFileSystem::new();
    let disk_manager = DiskManagerBuilder::new().build(filesystem);

    let (send, recv) = disk_manager.split();
    let mut blocking_send = send.wait();
    blocking_send.send(IDiskMessage::AddTorrent(layout)).unwrap();

    let mut core = Core::new().unwrap();
    let (msg, recv) = crate::next_message(&mut core, recv, 500);
    match msg {
        ODiskMessage::TorrentAdded(_) => {}
        unexpected => panic!("Unexpected Message: {:?}", unexpected),
    }

    blocking_send.send(IDiskMessage::AddTorrent(duplicate)).unwrap();

    let (msg, _recv) = crate::next_message(&mut core, recv, 500);
    match msg {
        ODiskMessage::TorrentError(..) => {}
        unexpected => panic!("Unexpected Message: {:?}", unexpected),
    }
}
