use std::io;
use std::path::PathBuf;

use bep_util::bt::InfoHash;

error_chain! {
    types {
        BlockError, BlockErrorKind, BlockResultExt, BlockResult;
    }

    foreign_links {
        Io(io::Error);
    }

    errors {
        InfoHashNotFound {
            hash: InfoHash
        } {
            description("Failed To Load/Process Block Because Torrent Is Not Loaded")
            display("Failed To Load/Process Block Because The InfoHash {:?} Is Not Currently Added", hash)
        }
        OperationAborted {
            description("Block Operation Was Aborted Before It Could Complete")
            display("Block Operation Was Aborted Before It Could Complete")
        }
        NoCacheMemory {
            description("Failed To Allocate A Cache Block For The Operation")
            display("Failed To Allocate A Cache Block For The Operation")
        }
    }
}

error_chain! {
    types {
        TorrentError, TorrentErrorKind, TorrentResultExt, TorrentResult;
    }

    foreign_links {
        Block(BlockError);
        Io(io::Error);
    }

    errors {
        ExistingFileSizeCheck {
            file_path:     PathBuf,
            expected_size: u64,
            actual_size:   u64
        } {
            description("Failed To Add Torrent Because Size Checker Failed For A File")
            display("Failed To Add Torrent Because Size Checker Failed For {:?} Where File Size Was {} But Should Have Been {}", file_path, actual_size, expected_size)
        }
        ExistingInfoHash {
            hash: InfoHash
        } {
            description("Failed To Add Torrent Because Another Torrent With The Same InfoHash Is Already Added")
            display("Failed To Add Torrent Because Another Torrent With The Same InfoHash {:?} Is Already Added", hash)
        }
        InfoHashNotFound {
            hash: InfoHash
        } {
            description("Failed To Execute Job Because The Torrent Is Not Currently Added")
            display("Failed To Execute Job Because The InfoHash {:?} Is Not Currently Added", hash)
        }
        OperationAborted {
            description("Job Was Aborted Before It Could Complete")
            display("Job Was Aborted Before It Could Complete")
        }
        CacheCapacity {
            description("Cache Had No Room For The Requested Operation")
            display("Cache Had No Room For The Requested Operation")
        }
        InvalidFileIndex {
            index: usize
        } {
            description("Failed To Execute Job Because The File Index Is Out Of Range")
            display("Failed To Execute Job Because The File Index {} Is Out Of Range", index)
        }
    }
}
