use api::scan::ScanProgress;

use crate::service::ESMResp;

#[derive(Debug)]
pub enum FsMsg {
    StartScan { resp: ESMResp<()> },
    CancelScan { resp: ESMResp<()> },
    ScanProgress { resp: ESMResp<ScanProgress> },
}
