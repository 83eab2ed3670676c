pub mod broadphase;
pub mod collide;
pub mod contact;
pub mod gjk;
pub mod narrowphase;
pub mod raycast;
