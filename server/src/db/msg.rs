use std::collections::HashSet;

use api::directory::Directory;
use api::media::{MediaRecord, MediaUuid};
use common::db::PendingRecord;

use crate::service::ESMResp;

#[derive(Debug)]
pub enum DbMsg {
    FindByPath {
        resp: ESMResp<Option<(MediaUuid, MediaRecord)>>,
        path: String,
    },
    FindAll {
        resp: ESMResp<Vec<(MediaUuid, MediaRecord)>>,
    },
    AllPaths {
        resp: ESMResp<HashSet<String>>,
    },
    SaveAll {
        resp: ESMResp<()>,
        batch: Vec<PendingRecord>,
    },
    Delete {
        resp: ESMResp<()>,
        paths: Vec<String>,
    },
    Count {
        resp: ESMResp<i64>,
    },
    UpsertDirectory {
        resp: ESMResp<()>,
        dir: Directory,
    },
}
