pub mod catalog_admin;
