//! Generated protobuf types and conversions to and from catalog types.

use crate::parents::ParentInfo;
use crate::range::{Key, RangeMeta, RemoteState};
use crate::roster::NodeRangeInfo;

pub mod pb {
    tonic::include_proto!("rangeplane");
}

pub fn remote_state_to_pb(state: RemoteState) -> pb::RemoteState {
    match state {
        RemoteState::Unknown => pb::RemoteState::RsUnknown,
        RemoteState::Preparing => pb::RemoteState::RsPreparing,
        RemoteState::Inactive => pb::RemoteState::RsInactive,
        RemoteState::Activating => pb::RemoteState::RsActivating,
        RemoteState::Active => pb::RemoteState::RsActive,
        RemoteState::Deactivating => pb::RemoteState::RsDeactivating,
        RemoteState::Dropping => pb::RemoteState::RsDropping,
        RemoteState::NotFound => pb::RemoteState::RsNotFound,
    }
}

pub fn remote_state_from_pb(state: pb::RemoteState) -> RemoteState {
    match state {
        pb::RemoteState::RsUnknown => RemoteState::Unknown,
        pb::RemoteState::RsPreparing => RemoteState::Preparing,
        pb::RemoteState::RsInactive => RemoteState::Inactive,
        pb::RemoteState::RsActivating => RemoteState::Activating,
        pb::RemoteState::RsActive => RemoteState::Active,
        pb::RemoteState::RsDeactivating => RemoteState::Deactivating,
        pb::RemoteState::RsDropping => RemoteState::Dropping,
        pb::RemoteState::RsNotFound => RemoteState::NotFound,
    }
}

pub fn meta_to_pb(meta: &RangeMeta) -> pb::RangeMeta {
    pb::RangeMeta {
        id: meta.id,
        start: meta.start.as_bytes().to_vec(),
        end: meta.end.as_bytes().to_vec(),
    }
}

pub fn meta_from_pb(meta: &pb::RangeMeta) -> RangeMeta {
    RangeMeta {
        id: meta.id,
        start: Key::from(meta.start.clone()),
        end: Key::from(meta.end.clone()),
    }
}

pub fn parent_to_pb(parent: &ParentInfo) -> pb::Parent {
    pb::Parent {
        range: Some(meta_to_pb(&parent.meta)),
        placements: parent
            .placements
            .iter()
            .map(|(node, state)| pb::ParentPlacement {
                node: node.clone(),
                state: state.to_string(),
            })
            .collect(),
    }
}

pub fn range_info_from_pb(info: &pb::RangeInfo) -> Option<NodeRangeInfo> {
    let meta = info.meta.as_ref()?;
    Some(NodeRangeInfo {
        meta: meta_from_pb(meta),
        state: remote_state_from_pb(info.state()),
        keys: info.key_count,
    })
}

pub fn range_info_to_pb(info: &NodeRangeInfo) -> pb::RangeInfo {
    pb::RangeInfo {
        meta: Some(meta_to_pb(&info.meta)),
        state: remote_state_to_pb(info.state) as i32,
        key_count: info.keys,
    }
}
