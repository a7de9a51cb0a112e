pub mod breadcrumbs;
pub mod collision;
pub mod movement;
pub mod stamina;
pub mod structures;
