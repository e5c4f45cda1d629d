fn main() {
    iq_annotator_lib::run()
}
