//! Binding of script class instances to scene nodes.

use {
    super::node::{NodeRef, NodeWeak, SceneNode},
    crate::qlang::{ClassInstance, QValue, Runtime, RuntimeError},
    std::rc::Rc,
};

/// Member every `GameNode` subclass starts with: the opaque engine pointer
/// written at attach time. Deliberately non-owning; node lifetime dominates
/// the script instance.
pub const NODE_PTR_MEMBER: &str = "NodePtr";

/// Lifecycle hooks the scene dispatches to attached scripts.
pub const HOOK_ON_PLAY: &str = "on_play";
pub const HOOK_ON_STOP: &str = "on_stop";
pub const HOOK_ON_UPDATE: &str = "on_update";

/// A script instance attached to a node. The instance is shared-owned; the
/// node back-reference is weak so a detached subtree can drop freely.
#[derive(Clone, Debug)]
pub struct ScriptPair {
    pub instance: Rc<ClassInstance>,
    pub node: NodeWeak,
    /// Content-relative `.q` path the class came from, for scene
    /// serialization.
    pub source: Option<String>,
}

/// Attach `instance` to `node`: writes the raw node address into the
/// instance's `NodePtr` member (when the class declares one) and appends the
/// pair to the node's script list.
pub fn attach_script(
    runtime: &mut Runtime,
    node: &NodeRef,
    instance: Rc<ClassInstance>,
    source: Option<String>,
) -> Result<(), RuntimeError> {
    let raw: *mut SceneNode = node.as_ptr();
    if instance.layout().member(NODE_PTR_MEMBER).is_some() {
        runtime.set_member(
            &instance,
            NODE_PTR_MEMBER,
            QValue::CPtr(raw as *mut std::ffi::c_void),
        )?;
    }
    node.borrow_mut().push_script(ScriptPair {
        instance,
        node: Rc::downgrade(node),
        source,
    });
    Ok(())
}

/// Run one lifecycle hook on every script of `node`. Script faults are
/// logged and the frame continues; they never unwind into the render loop.
pub fn dispatch(runtime: &mut Runtime, node: &NodeRef, method: &str, args: &[QValue]) {
    // Clone the list out so no borrow of the node is live while scripts run:
    // native functions reach back into the node through `NodePtr`.
    let scripts: Vec<ScriptPair> = node.borrow().scripts().to_vec();
    for pair in scripts {
        if !runtime.has_method(&pair.instance, method) {
            continue;
        }
        if let Err(err) = runtime.call_method(&pair.instance, method, args) {
            log::warn!(
                "script {}::{}: {err}",
                pair.instance.class_name(),
                method
            );
        }
    }
}
