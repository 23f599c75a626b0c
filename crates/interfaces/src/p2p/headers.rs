use crate::{
    consensus::Consensus,
    p2p::error::{DownloadError, DownloadResult},
};
use dos_primitives::{PeerId, SealedHeader};

/// Validate whether the header is valid in relation to it's parent
pub fn validate_header_download<C: Consensus + ?Sized>(
    consensus: &C,
    peer_id: PeerId,
    header: &SealedHeader,
    parent: &SealedHeader,
) -> DownloadResult<()> {
    ensure_parent(peer_id, header, parent)?;
    consensus.validate_header(header, parent).map_err(|error| DownloadError::HeaderValidation {
        peer_id,
        number: header.number,
        hash: header.hash(),
        error,
    })?;
    Ok(())
}

/// Ensures that the given `parent` header is the actual parent of the `header`
pub fn ensure_parent(
    peer_id: PeerId,
    header: &SealedHeader,
    parent: &SealedHeader,
) -> DownloadResult<()> {
    if !header.is_child_of(parent) {
        return Err(DownloadError::MismatchedHeaders {
            peer_id,
            header_number: header.number,
            parent_number: parent.number,
            header_hash: header.hash(),
            parent_hash: parent.hash(),
        })
    }
    Ok(())
}
