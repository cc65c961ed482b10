pub mod subroutines;
