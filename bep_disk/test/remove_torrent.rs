use crate::InMemoryFileSystem;
use bep_disk::{DiskManagerBuilder, IDiskMessage, ODiskMessage};
use futures::sink::Sink;
use futures::stream::Stream;
use tokio_core::reactor::Core;

#[test]
fn positive_remove_torrent_flushes_dirty_blocks() {
    let layout = crate::simple_layout(30, 16384 * 4, 16384 * 4);
    let hash = *layout.info_hash();
    let data = crate::random_buffer(16384);

    let filesystem = InMemoryFileSystem::new();
    let check_files = filesystem.clone();
    let disk_manager = DiskManagerBuilder::new().build(filesystem);

    let (send, recv) = disk_manager.split();
    let mut blocking_send = send.wait();
    blocking_send.send(IDiskMessage::AddTorrent(layout)).unwrap();

    let mut core = Core::new().unwrap();
    let (msg, mut recv) = crate::next_message(&mut core, recv, 2000);
    match msg {
        ODiskMessage::TorrentAdded(_) => {}
        unexpected => panic!("Unexpected Message: {:?}", unexpected),
    }

    // One block of a four block piece stays dirty in the cache, the stop
    // has to flush it on its way out.
    crate::send_block(&mut blocking_send, &data, hash, 0, 0);
    blocking_send.send(IDiskMessage::RemoveTorrent(hash)).unwrap();

    loop {
        let (msg, next_recv) = crate::next_message(&mut core, recv, 2000);
        recv = next_recv;

        match msg {
            ODiskMessage::BlockProcessed(_) | ODiskMessage::ProcessBlockError(..) => {}
            ODiskMessage::TorrentRemoved(recv_hash) => {
                assert_eq!(hash, recv_hash);
                break;
            }
            unexpected => panic!("Unexpected Message: {:?}", unexpected),
        }
    }

    // The dirty block was flushed before the torrent went away.
    check_files.with_files(|files| {
        let file = files.values().next().unwrap();
        assert_eq!(&file[..16384], &data[..]);
    });
}

#[test]
fn negative_load_after_remove() {
    let layout = crate::simple_layout(31, 16384, 16384);
    let hash = *layout.info_hash();

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

    blocking_send.send(IDiskMessage::RemoveTorrent(hash)).unwrap();
    let (msg, recv) = crate::next_message(&mut core, recv, 2000);
    match msg {
        ODiskMessage::TorrentRemoved(_) => {}
        unexpected => panic!("Unexpected Message: {:?}", unexpected),
    }

    crate::send_load(&mut blocking_send, hash, 0, 0, 16384);
    let (msg, _recv) = crate::next_message(&mut core, recv, 2000);
    match msg {
        ODiskMessage::LoadBlockError(..) => {}
        unexpected => panic!("Unexpected Message: {:?}", unexpected),
    }
}
