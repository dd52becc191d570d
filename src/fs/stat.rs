use crate::fs::vnode::VnodeKind;

/// File metadata as reported by the `stat` vnode operation.
#[derive(Clone, Debug)]
pub struct Stat {
    pub ino: u32,
    pub kind: VnodeKind,
    pub nlink: u16,
    pub size: usize,
    /// Allocated disk blocks, including an indirect block but not holes.
    pub blocks: u32,
}
